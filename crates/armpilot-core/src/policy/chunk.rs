//! Action chunk normalization and per-step slicing

use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayD, Axis, Ix2};

use super::{InferenceResult, PolicyField};
use crate::hardware::{Joints, ACTION_DIM};
use crate::{Error, Result};

/// A normalized action sequence plus the auxiliary fields it arrived with
///
/// Invariant: at least one frame; frame 0 is the immediate next pose.
#[derive(Debug, Clone)]
pub struct ActionChunk {
    frames: Vec<Joints>,
    fields: BTreeMap<String, PolicyField>,
}

impl ActionChunk {
    /// Normalize a raw inference result into a chunk
    ///
    /// Accepted action shapes:
    /// - `[D]`: a single frame, promoted to a length-1 chunk
    /// - `[T, D]`: the nominal chunk
    /// - `[1, T, D]`: batched output, squeezed
    ///
    /// `D` may exceed 7 (padded action spaces); only the first 7 entries are
    /// kept. Everything else fails with [`Error::Shape`].
    pub fn from_result(result: InferenceResult) -> Result<Self> {
        let actions = normalize_actions(result.actions)?;
        let frames = actions
            .outer_iter()
            .map(|row| {
                let mut frame = [0.0; ACTION_DIM];
                for (slot, &v) in frame.iter_mut().zip(row.iter()) {
                    *slot = v;
                }
                frame
            })
            .collect();
        Ok(Self {
            frames,
            fields: result.fields,
        })
    }

    /// Number of frames
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false for a constructed chunk
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Action frame at `index`
    pub fn frame(&self, index: usize) -> Option<&Joints> {
        self.frames.get(index)
    }

    /// Auxiliary fields for step `index`
    ///
    /// Arrays with more than one dimension whose leading dimension equals the
    /// chunk length are sliced alongside the actions; everything else is
    /// passed through unchanged.
    pub fn fields_at(&self, index: usize) -> BTreeMap<String, PolicyField> {
        let len = self.len();
        self.fields
            .iter()
            .map(|(name, field)| {
                let value = match field {
                    PolicyField::Array(a) if a.ndim() > 1 && a.shape()[0] == len => {
                        PolicyField::Array(a.index_axis(Axis(0), index).to_owned())
                    }
                    other => other.clone(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

fn normalize_actions(actions: ArrayD<f64>) -> Result<Array2<f64>> {
    let shape = actions.shape().to_vec();
    let actions = match shape.len() {
        0 => return Err(Error::Shape("action is a scalar".into())),
        1 => actions.insert_axis(Axis(0)),
        2 => actions,
        3 if shape[0] == 1 => actions.index_axis_move(Axis(0), 0),
        3 => {
            return Err(Error::Shape(format!(
                "batched action with batch size {} (shape {:?})",
                shape[0], shape
            )))
        }
        n => return Err(Error::Shape(format!("action rank {} (shape {:?})", n, shape))),
    };
    let actions = actions
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::Shape(format!("action reshape failed: {}", e)))?;

    let (len, dim) = actions.dim();
    if len == 0 {
        return Err(Error::Shape("empty action chunk".into()));
    }
    if dim < ACTION_DIM {
        return Err(Error::Shape(format!(
            "action width {} is smaller than {}",
            dim, ACTION_DIM
        )));
    }
    let actions = if dim > ACTION_DIM {
        tracing::debug!("Truncating padded action width {} to {}", dim, ACTION_DIM);
        actions.slice(s![.., ..ACTION_DIM]).to_owned()
    } else {
        actions
    };
    if actions.iter().any(|v| !v.is_finite()) {
        return Err(Error::Shape("action chunk contains non-finite values".into()));
    }
    Ok(actions)
}

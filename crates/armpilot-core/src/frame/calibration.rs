//! Calibration frame: sign vector, normalization scale, and zero offset

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hardware::{Joints, ACTION_DIM, GRIPPER, NUM_ARM_JOINTS};
use crate::math::map_range;
use crate::{Error, Result};

/// What "policy zero" means on the physical arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroConvention {
    /// Zero is the pose the arm was in when it connected
    #[default]
    RelativePowerOn,
    /// Zero is the encoder's absolute zero; no offset is applied
    AbsoluteEncoder,
}

/// Per-connection calibration
///
/// Built from configuration, then [`capture`](Self::capture)d once at connect
/// time. Read-only until the next reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationFrame {
    /// Version tag tying recordings to a convention
    pub version: Arc<str>,
    /// Per-joint sign (+1/-1) from policy rotational sense to actuator sense
    pub signs: Joints,
    /// Per-joint normalization scale (policy value × scale = radians)
    pub scale: Joints,
    /// Offset added after sign/scale; zero under [`ZeroConvention::AbsoluteEncoder`]
    pub zero_offset: Joints,
    /// Zero-point convention
    pub convention: ZeroConvention,
}

impl CalibrationFrame {
    /// Normalization scale used by policies trained on normalized joint ranges
    pub const NORMALIZED_SCALE: Joints = [3.0, 3.0, 3.0, 1.7, 0.4, 2.0, 1.0];

    /// Create an uncaptured frame (zero offset all-zero)
    pub fn new(
        version: impl Into<Arc<str>>,
        signs: Joints,
        scale: Joints,
        convention: ZeroConvention,
    ) -> Result<Self> {
        if let Some(i) = signs.iter().position(|s| *s != 1.0 && *s != -1.0) {
            return Err(Error::Config(format!(
                "sign for joint {} must be +1 or -1, got {}",
                i, signs[i]
            )));
        }
        if let Some(i) = scale.iter().position(|s| !s.is_finite() || *s == 0.0) {
            return Err(Error::Config(format!(
                "scale for joint {} must be finite and non-zero, got {}",
                i, scale[i]
            )));
        }
        Ok(Self {
            version: version.into(),
            signs,
            scale,
            zero_offset: [0.0; ACTION_DIM],
            convention,
        })
    }

    /// Identity frame: unit signs and scale, absolute zero
    pub fn identity() -> Self {
        Self {
            version: "identity".into(),
            signs: [1.0; ACTION_DIM],
            scale: [1.0; ACTION_DIM],
            zero_offset: [0.0; ACTION_DIM],
            convention: ZeroConvention::AbsoluteEncoder,
        }
    }

    /// Capture the zero offset from a physical reading taken at connect time
    ///
    /// Under [`ZeroConvention::RelativePowerOn`] the arm joints' readings
    /// become the offset; the gripper is never offset.
    pub fn capture(&self, physical: &Joints) -> Self {
        let mut zero_offset = [0.0; ACTION_DIM];
        if self.convention == ZeroConvention::RelativePowerOn {
            zero_offset[..NUM_ARM_JOINTS].copy_from_slice(&physical[..NUM_ARM_JOINTS]);
        }
        debug_assert_eq!(zero_offset[GRIPPER], 0.0);
        Self {
            zero_offset,
            ..self.clone()
        }
    }
}

impl Default for CalibrationFrame {
    fn default() -> Self {
        Self::identity()
    }
}

/// Gripper encoder travel mapped linearly onto [0, 1] (0 = open, 1 = closed)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GripperRange {
    /// Encoder angle when fully open
    pub open: f64,
    /// Encoder angle when fully closed
    pub closed: f64,
}

impl Default for GripperRange {
    fn default() -> Self {
        Self {
            open: 0.0,
            closed: -1.75,
        }
    }
}

impl GripperRange {
    /// Encoder angle → normalized opening
    pub fn to_normalized(&self, encoder: f64) -> f64 {
        map_range(encoder, self.open, self.closed, 0.0, 1.0)
    }

    /// Normalized opening → encoder angle
    pub fn to_encoder(&self, normalized: f64) -> f64 {
        map_range(normalized, 0.0, 1.0, self.open, self.closed)
    }

    /// Whether both ends of the travel lie inside `[lo, hi]`
    pub fn fits(&self, lo: f64, hi: f64) -> bool {
        [self.open, self.closed]
            .iter()
            .all(|&end| end.is_finite() && (lo..=hi).contains(&end))
    }
}

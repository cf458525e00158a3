//! Policy collaborator interface and chunked action serving
//!
//! A [`Policy`] turns one [`Observation`] into an [`InferenceResult`] holding
//! an action chunk plus auxiliary fields. The [`ChunkBroker`] caches that
//! chunk and serves it one timestep at a time.
//!
//! # Example
//!
//! ```
//! use armpilot_core::policy::{ChunkBroker, InferenceResult, Observation, Policy};
//! use armpilot_core::Result;
//! use ndarray::{ArrayD, IxDyn};
//!
//! struct Still;
//!
//! impl Policy for Still {
//!     fn infer(&mut self, _obs: &Observation) -> Result<InferenceResult> {
//!         Ok(InferenceResult::new(ArrayD::zeros(IxDyn(&[4, 7]))))
//!     }
//! }
//!
//! let mut broker = ChunkBroker::new(Still, 2)?;
//! let obs = Observation::new([0.0; 7], "pick up the cube");
//! let step = broker.next_action(&obs)?;
//! assert!(step.new_chunk);
//! assert_eq!(broker.cursor(), 1);
//! # Ok::<(), armpilot_core::Error>(())
//! ```

mod broker;
mod chunk;
mod ws;

pub use broker::{ChunkBroker, StepAction};
pub use chunk::ActionChunk;
pub use ws::{WebsocketPolicyClient, WebsocketPolicyConfig};

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::ArrayD;

use crate::hardware::{Frame, Joints};
use crate::Result;

/// Free-form metadata reported by the policy server
pub type ServerMetadata = serde_json::Map<String, serde_json::Value>;

/// What the policy sees on one control tick
#[derive(Debug, Clone)]
pub struct Observation {
    /// Joint state in the policy frame
    pub state: Joints,
    /// Camera frames by channel name
    pub images: Option<BTreeMap<String, Frame>>,
    /// Episode-level task prompt
    pub prompt: Arc<str>,
}

impl Observation {
    /// Observation without images
    pub fn new(state: Joints, prompt: impl Into<Arc<str>>) -> Self {
        Self {
            state,
            images: None,
            prompt: prompt.into(),
        }
    }

    /// Attach camera frames
    pub fn with_images(mut self, images: BTreeMap<String, Frame>) -> Self {
        self.images = Some(images);
        self
    }
}

/// An auxiliary field of a policy result
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyField {
    /// Numeric array; sliced per step when its leading dimension is the chunk length
    Array(ArrayD<f64>),
    /// Anything else (strings, timing dicts, scalars); always passed through
    Value(serde_json::Value),
}

impl PolicyField {
    /// Borrow as an array, if numeric
    pub fn as_array(&self) -> Option<&ArrayD<f64>> {
        match self {
            PolicyField::Array(a) => Some(a),
            PolicyField::Value(_) => None,
        }
    }
}

/// Raw output of one inference call
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Action array, nominally `[T, 7]`; see [`ActionChunk::from_result`]
    pub actions: ArrayD<f64>,
    /// Auxiliary fields by name
    pub fields: BTreeMap<String, PolicyField>,
}

impl InferenceResult {
    /// Result with actions only
    pub fn new(actions: ArrayD<f64>) -> Self {
        Self {
            actions,
            fields: BTreeMap::new(),
        }
    }

    /// Add an auxiliary field
    pub fn with_field(mut self, name: impl Into<String>, field: PolicyField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }
}

/// The remote inference service, seen as a blocking request/response call
pub trait Policy: Send {
    /// Infer an action chunk for this observation
    fn infer(&mut self, observation: &Observation) -> Result<InferenceResult>;

    /// Drop any server-side episode context
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Server metadata, fetched once at startup
    fn metadata(&mut self) -> Result<ServerMetadata> {
        Ok(ServerMetadata::new())
    }
}

impl<P: Policy + ?Sized> Policy for Box<P> {
    fn infer(&mut self, observation: &Observation) -> Result<InferenceResult> {
        (**self).infer(observation)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn metadata(&mut self) -> Result<ServerMetadata> {
        (**self).metadata()
    }
}

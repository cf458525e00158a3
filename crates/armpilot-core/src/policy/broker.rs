//! Chunk broker: serve a cached action chunk one step at a time

use std::collections::BTreeMap;

use super::{ActionChunk, Observation, Policy, PolicyField, ServerMetadata};
use crate::hardware::Joints;
use crate::{Error, Result};

/// One step served by the broker
#[derive(Debug, Clone)]
pub struct StepAction {
    /// Policy-frame action for this tick
    pub action: Joints,
    /// Auxiliary fields, sliced to this step where applicable
    pub fields: BTreeMap<String, PolicyField>,
    /// True when this step triggered a fresh inference
    pub new_chunk: bool,
    /// Position of this step within its chunk
    pub index: usize,
}

/// Amortizes one inference call over several control ticks
///
/// The effective reuse window is `min(horizon, chunk_length)` steps. The
/// observation passed while a chunk is cached is ignored; there is no
/// blending between consecutive chunks.
pub struct ChunkBroker<P> {
    policy: P,
    horizon: usize,
    chunk: Option<ActionChunk>,
    cursor: usize,
    inferences: u64,
}

impl<P: Policy> ChunkBroker<P> {
    /// Wrap a policy; `horizon` must be at least 1
    pub fn new(policy: P, horizon: usize) -> Result<Self> {
        if horizon == 0 {
            return Err(Error::Config("action horizon must be at least 1".into()));
        }
        Ok(Self {
            policy,
            horizon,
            chunk: None,
            cursor: 0,
            inferences: 0,
        })
    }

    /// Serve the action for this tick, inferring only when the cache is empty
    ///
    /// Inference and shape errors propagate unchanged and leave the cache
    /// empty, so the next call infers again.
    pub fn next_action(&mut self, observation: &Observation) -> Result<StepAction> {
        let new_chunk = self.chunk.is_none();
        if new_chunk {
            tracing::debug!("Requesting new action chunk (horizon {})", self.horizon);
            let result = self.policy.infer(observation)?;
            self.inferences += 1;
            let chunk = ActionChunk::from_result(result)?;
            if chunk.len() < self.horizon {
                tracing::debug!(
                    "Chunk length {} shorter than horizon {}",
                    chunk.len(),
                    self.horizon
                );
            }
            self.chunk = Some(chunk);
            self.cursor = 0;
        }

        let chunk = self
            .chunk
            .as_ref()
            .ok_or_else(|| Error::InvalidState("chunk cache empty after inference".into()))?;
        let index = self.cursor;
        let action = *chunk
            .frame(index)
            .ok_or_else(|| Error::InvalidState(format!("chunk cursor {} out of range", index)))?;
        let fields = chunk.fields_at(index);
        let len = chunk.len();

        self.cursor += 1;
        if self.cursor >= self.horizon || self.cursor >= len {
            self.clear();
        }

        Ok(StepAction {
            action,
            fields,
            new_chunk,
            index,
        })
    }

    /// Drop the cached chunk without touching the policy
    pub fn clear(&mut self) {
        self.chunk = None;
        self.cursor = 0;
    }

    /// Drop the cached chunk and reset the policy's episode context
    pub fn reset(&mut self) -> Result<()> {
        self.clear();
        self.policy.reset()
    }

    /// Fetch server metadata
    pub fn metadata(&mut self) -> Result<ServerMetadata> {
        self.policy.metadata()
    }

    /// Steps already served from the current chunk
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether a chunk is cached
    #[inline]
    pub fn has_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    #[inline]
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Total successful inference calls
    #[inline]
    pub fn inference_count(&self) -> u64 {
        self.inferences
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }
}

impl<P> std::fmt::Debug for ChunkBroker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBroker")
            .field("horizon", &self.horizon)
            .field("cursor", &self.cursor)
            .field("cached", &self.chunk.as_ref().map(|c| c.len()))
            .field("inferences", &self.inferences)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::InferenceResult;
    use ndarray::{ArrayD, IxDyn};

    /// Returns chunks whose frame `t` is `[base + t; 7]`, `base` bumping by 100 per call
    struct Counting {
        len: usize,
        calls: usize,
        resets: usize,
        fail: bool,
    }

    impl Counting {
        fn new(len: usize) -> Self {
            Self {
                len,
                calls: 0,
                resets: 0,
                fail: false,
            }
        }
    }

    impl Policy for Counting {
        fn infer(&mut self, _obs: &Observation) -> Result<InferenceResult> {
            if self.fail {
                return Err(Error::Transport("connection refused".into()));
            }
            let base = (self.calls * 100) as f64;
            self.calls += 1;
            let data = (0..self.len)
                .flat_map(|t| std::iter::repeat(base + t as f64).take(7))
                .collect();
            Ok(InferenceResult::new(
                ArrayD::from_shape_vec(IxDyn(&[self.len, 7]), data).unwrap(),
            ))
        }

        fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }
    }

    fn obs() -> Observation {
        Observation::new([0.0; 7], "test")
    }

    #[test]
    fn test_zero_horizon_rejected() {
        assert!(matches!(
            ChunkBroker::new(Counting::new(5), 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_horizon_one_infers_every_step() {
        let mut broker = ChunkBroker::new(Counting::new(1), 1).unwrap();
        for i in 0..5 {
            let step = broker.next_action(&obs()).unwrap();
            assert!(step.new_chunk);
            assert_eq!(step.index, 0);
            assert_eq!(step.action[0], (i * 100) as f64);
        }
        assert_eq!(broker.policy().calls, 5);
    }

    #[test]
    fn test_horizon_shorter_than_chunk() {
        let mut broker = ChunkBroker::new(Counting::new(50), 25).unwrap();
        let steps: Vec<_> = (0..50).map(|_| broker.next_action(&obs()).unwrap()).collect();

        assert_eq!(broker.policy().calls, 2);
        assert!(steps[0].new_chunk && steps[25].new_chunk);
        assert_eq!(steps[24].action[0], 24.0);
        // frames 25..50 of the first chunk are never served
        assert_eq!(steps[25].action[0], 100.0);
        assert_eq!(steps.iter().filter(|s| s.new_chunk).count(), 2);
    }

    #[test]
    fn test_chunk_shorter_than_horizon() {
        let mut broker = ChunkBroker::new(Counting::new(3), 20).unwrap();
        for _ in 0..9 {
            broker.next_action(&obs()).unwrap();
        }
        assert_eq!(broker.inference_count(), 3);
        assert!(!broker.has_chunk());
    }

    #[test]
    fn test_single_frame_result_lasts_one_step() {
        struct Single;
        impl Policy for Single {
            fn infer(&mut self, _obs: &Observation) -> Result<InferenceResult> {
                Ok(InferenceResult::new(ArrayD::from_elem(IxDyn(&[7]), 0.25)))
            }
        }
        let mut broker = ChunkBroker::new(Single, 10).unwrap();
        assert!(broker.next_action(&obs()).unwrap().new_chunk);
        assert!(broker.next_action(&obs()).unwrap().new_chunk);
        assert_eq!(broker.inference_count(), 2);
    }

    #[test]
    fn test_cursor_stays_in_window() {
        let mut broker = ChunkBroker::new(Counting::new(7), 4).unwrap();
        for _ in 0..30 {
            broker.next_action(&obs()).unwrap();
            assert!(broker.cursor() < 4);
        }
    }

    #[test]
    fn test_reset_mid_chunk() {
        let mut broker = ChunkBroker::new(Counting::new(10), 10).unwrap();
        for _ in 0..3 {
            broker.next_action(&obs()).unwrap();
        }
        assert_eq!(broker.cursor(), 3);

        broker.reset().unwrap();
        assert_eq!(broker.cursor(), 0);
        assert!(!broker.has_chunk());
        assert_eq!(broker.policy().resets, 1);

        let step = broker.next_action(&obs()).unwrap();
        assert!(step.new_chunk);
        assert_eq!(step.action[0], 100.0);
    }

    #[test]
    fn test_transport_error_propagates_without_retry() {
        let mut policy = Counting::new(5);
        policy.fail = true;
        let mut broker = ChunkBroker::new(policy, 5).unwrap();

        assert!(matches!(
            broker.next_action(&obs()),
            Err(Error::Transport(_))
        ));
        assert!(!broker.has_chunk());
        assert_eq!(broker.inference_count(), 0);

        broker.policy_mut().fail = false;
        assert!(broker.next_action(&obs()).unwrap().new_chunk);
    }

    #[test]
    fn test_aux_fields_follow_cursor() {
        struct WithLogits;
        impl Policy for WithLogits {
            fn infer(&mut self, _obs: &Observation) -> Result<InferenceResult> {
                let logits = ArrayD::from_shape_vec(
                    IxDyn(&[5, 3]),
                    (0..15).map(|i| i as f64).collect(),
                )
                .unwrap();
                Ok(InferenceResult::new(ArrayD::zeros(IxDyn(&[5, 7])))
                    .with_field("logits", PolicyField::Array(logits))
                    .with_field("meta", PolicyField::Value(serde_json::json!("v1"))))
            }
        }
        let mut broker = ChunkBroker::new(WithLogits, 5).unwrap();
        for k in 0..5 {
            let step = broker.next_action(&obs()).unwrap();
            let logits = step.fields["logits"].as_array().unwrap();
            assert_eq!(logits.shape(), &[3]);
            assert_eq!(logits[[0]], (k * 3) as f64);
            assert_eq!(step.fields["meta"], PolicyField::Value(serde_json::json!("v1")));
        }
    }
}

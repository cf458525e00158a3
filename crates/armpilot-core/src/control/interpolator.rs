//! Chunk-boundary smoothing
//!
//! Independent inference calls disagree slightly on the current pose, so the
//! first frame of a new chunk can sit a visible jump away from the last
//! commanded pose. [`bridge`] fills that gap with evenly spaced arm-joint
//! poses; the gripper is held and snaps when the chunk frame itself plays.

use crate::hardware::Joints;
use crate::math::lerp_arm;

/// Sub-steps strictly between `start` and `target`
///
/// Yields `steps` poses at `α = k / (steps + 1)` for `k = 1..=steps`. Neither
/// endpoint is included. Arm joints move linearly; the gripper stays at
/// `start`'s value.
pub fn bridge(start: &Joints, target: &Joints, steps: usize) -> Ramp {
    Ramp {
        start: *start,
        target: *target,
        k: 0,
        count: steps,
        denom: (steps + 1) as f64,
    }
}

/// `steps` poses ending exactly on `target`
///
/// Yields `α = (i + 1) / steps` for `i = 0..steps`. Used for the shutdown
/// home where the last pose must land on the destination.
pub fn ramp(start: &Joints, target: &Joints, steps: usize) -> Ramp {
    Ramp {
        start: *start,
        target: *target,
        k: 0,
        count: steps,
        denom: steps.max(1) as f64,
    }
}

/// Iterator over interpolated poses
#[derive(Debug, Clone)]
pub struct Ramp {
    start: Joints,
    target: Joints,
    k: usize,
    count: usize,
    denom: f64,
}

impl Iterator for Ramp {
    type Item = Joints;

    fn next(&mut self) -> Option<Joints> {
        if self.k >= self.count {
            return None;
        }
        self.k += 1;
        Some(lerp_arm(&self.start, &self.target, self.k as f64 / self.denom))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.count - self.k;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Ramp {}

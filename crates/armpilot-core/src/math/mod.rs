//! Small numeric helpers shared by the interpolator and the translator

use crate::hardware::{Joints, NUM_ARM_JOINTS};

/// Linearly interpolate between two values
#[inline]
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Map `x` from `[in_min, in_max]` onto `[out_min, out_max]` (no clipping)
#[inline]
pub fn map_range(x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> f64 {
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

/// Interpolate the arm joints of two poses, holding the gripper at `start`
pub fn lerp_arm(start: &Joints, target: &Joints, t: f64) -> Joints {
    let mut out = *start;
    for i in 0..NUM_ARM_JOINTS {
        out[i] = lerp(start[i], target[i], t);
    }
    out
}

/// Largest absolute per-joint difference over the arm joints (gripper excluded)
pub fn max_arm_deviation(a: &Joints, b: &Joints) -> f64 {
    a.iter()
        .zip(b.iter())
        .take(NUM_ARM_JOINTS)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

//! Per-joint hardware-safe limits and the clamp applied to every command

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::hardware::{Joints, ACTION_DIM, GRIPPER, JOINT_NAMES, NUM_ARM_JOINTS};
use crate::{Error, Result};

/// A closed interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointInterval {
    pub min: f64,
    pub max: f64,
}

impl JointInterval {
    /// Create an interval
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Clip a value into the interval. NaN maps to the point nearest zero.
    #[inline]
    pub fn clip(&self, value: f64) -> f64 {
        if value.is_nan() {
            0.0f64.clamp(self.min, self.max)
        } else {
            value.clamp(self.min, self.max)
        }
    }

    /// Check membership
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Gripper interval, fixed at [0, 1]
pub const GRIPPER_INTERVAL: JointInterval = JointInterval::new(0.0, 1.0);

/// Joint limits for the 6 arm joints (radians); the gripper is always [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    arm: [JointInterval; NUM_ARM_JOINTS],
}

impl Default for JointLimits {
    fn default() -> Self {
        Self {
            arm: [
                JointInterval::new(-3.0, 3.0),
                JointInterval::new(0.0, 3.0),
                JointInterval::new(0.0, 3.0),
                JointInterval::new(-1.7, 1.2),
                JointInterval::new(-0.4, 0.4),
                JointInterval::new(-2.0, 2.0),
            ],
        }
    }
}

impl JointLimits {
    /// Create a limit table, rejecting inverted or non-finite intervals
    pub fn new(arm: [JointInterval; NUM_ARM_JOINTS]) -> Result<Self> {
        let limits = Self { arm };
        limits.validate()?;
        Ok(limits)
    }

    /// Reject inverted or non-finite intervals (tables loaded from config skip `new`)
    pub fn validate(&self) -> Result<()> {
        for (i, interval) in self.arm.iter().enumerate() {
            if !interval.min.is_finite() || !interval.max.is_finite() || interval.min > interval.max
            {
                return Err(Error::Config(format!(
                    "invalid limit for {}: [{}, {}]",
                    JOINT_NAMES[i], interval.min, interval.max
                )));
            }
        }
        Ok(())
    }

    /// Interval for a joint index (gripper included)
    pub fn interval(&self, joint: usize) -> Option<JointInterval> {
        match joint {
            j if j < NUM_ARM_JOINTS => Some(self.arm[j]),
            GRIPPER => Some(GRIPPER_INTERVAL),
            _ => None,
        }
    }

    /// Check that every joint lies within its interval
    pub fn contains(&self, target: &Joints) -> bool {
        target
            .iter()
            .enumerate()
            .all(|(i, &v)| self.interval(i).is_some_and(|iv| iv.contains(v)))
    }

    /// Clip every joint into its interval, reporting which ones moved
    pub fn clamp(&self, target: &Joints) -> (Joints, ClampReport) {
        let mut safe = *target;
        let mut report = ClampReport::default();
        for (i, value) in safe.iter_mut().enumerate() {
            let interval = if i < NUM_ARM_JOINTS {
                self.arm[i]
            } else {
                GRIPPER_INTERVAL
            };
            let clipped = interval.clip(*value);
            // NaN != NaN, so a NaN input is always reported
            if clipped != *value {
                report.push(i, *value, clipped);
            }
            *value = clipped;
        }
        (safe, report)
    }
}

/// One clipped joint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampedJoint {
    pub joint: usize,
    pub requested: f64,
    pub applied: f64,
}

/// Which joints a clamp corrected; empty when the command was already safe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClampReport {
    joints: ArrayVec<ClampedJoint, ACTION_DIM>,
}

impl ClampReport {
    fn push(&mut self, joint: usize, requested: f64, applied: f64) {
        self.joints.push(ClampedJoint {
            joint,
            requested,
            applied,
        });
    }

    /// True when nothing was clipped
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    /// Number of clipped joints
    #[inline]
    pub fn len(&self) -> usize {
        self.joints.len()
    }

    /// The clipped joints
    pub fn joints(&self) -> &[ClampedJoint] {
        &self.joints
    }
}

impl std::fmt::Display for ClampReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (n, c) in self.joints.iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{} {:.3}->{:.3}",
                JOINT_NAMES[c.joint], c.requested, c.applied
            )?;
        }
        Ok(())
    }
}

//! Pure per-joint transforms between the policy frame and the actuator frame

use super::{CalibrationFrame, ClampReport, JointLimits};
use crate::hardware::{Joints, ACTION_DIM};

/// A command ready for the hardware adapter
#[derive(Debug, Clone, PartialEq)]
pub struct SafeCommand {
    /// Physical-frame target, inside [`JointLimits`]
    pub target: Joints,
    /// Joints the clamp had to correct
    pub report: ClampReport,
}

/// Translator between policy and physical frames, with the safety clamp
#[derive(Debug, Clone, Default)]
pub struct FrameTranslator {
    calibration: CalibrationFrame,
    limits: JointLimits,
}

impl FrameTranslator {
    /// Create a translator from a calibration frame and limit table
    pub fn new(calibration: CalibrationFrame, limits: JointLimits) -> Self {
        Self {
            calibration,
            limits,
        }
    }

    /// Current calibration frame
    pub fn calibration(&self) -> &CalibrationFrame {
        &self.calibration
    }

    /// Limit table
    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    /// Replace the calibration (on reconnect)
    pub fn set_calibration(&mut self, calibration: CalibrationFrame) {
        self.calibration = calibration;
    }

    /// Policy frame → physical frame: `policy × scale × sign + zero_offset`
    pub fn to_physical(&self, policy: &Joints) -> Joints {
        let c = &self.calibration;
        let mut out = [0.0; ACTION_DIM];
        for i in 0..ACTION_DIM {
            out[i] = policy[i] * c.scale[i] * c.signs[i] + c.zero_offset[i];
        }
        out
    }

    /// Physical frame → policy frame: `(physical − zero_offset) × sign ÷ scale`
    pub fn to_policy(&self, physical: &Joints) -> Joints {
        let c = &self.calibration;
        let mut out = [0.0; ACTION_DIM];
        for i in 0..ACTION_DIM {
            out[i] = (physical[i] - c.zero_offset[i]) * c.signs[i] / c.scale[i];
        }
        out
    }

    /// Clip a physical target into the joint limits
    #[inline]
    pub fn clamp(&self, physical: &Joints) -> (Joints, ClampReport) {
        self.limits.clamp(physical)
    }

    /// Translate a policy-frame pose and clamp it; the only path to the hardware
    pub fn command(&self, policy: &Joints) -> SafeCommand {
        let (target, report) = self.clamp(&self.to_physical(policy));
        SafeCommand { target, report }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ZeroConvention;
    use crate::hardware::GRIPPER;
    use approx::assert_relative_eq;

    fn calibrated() -> FrameTranslator {
        let frame = CalibrationFrame::new(
            "test-v1",
            [1.0, -1.0, -1.0, 1.0, -1.0, 1.0, 1.0],
            CalibrationFrame::NORMALIZED_SCALE,
            ZeroConvention::RelativePowerOn,
        )
        .unwrap()
        .capture(&[0.3, 1.2, 0.8, -0.2, 0.05, 0.4, 0.6]);
        FrameTranslator::new(frame, JointLimits::default())
    }

    /// Deterministic pseudo-random readings spanning well outside the limits
    fn readings(n: usize) -> Vec<Joints> {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        (0..n)
            .map(|_| {
                let mut p = [0.0; ACTION_DIM];
                for v in p.iter_mut() {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    *v = (state % 20_000) as f64 / 1000.0 - 10.0;
                }
                p
            })
            .collect()
    }

    #[test]
    fn test_round_trip_physical() {
        let t = calibrated();
        for p in readings(500) {
            let back = t.to_physical(&t.to_policy(&p));
            for i in 0..ACTION_DIM {
                assert_relative_eq!(back[i], p[i], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_round_trip_absolute_convention() {
        let frame = CalibrationFrame::new(
            "abs",
            [-1.0; ACTION_DIM],
            [1.0; ACTION_DIM],
            ZeroConvention::AbsoluteEncoder,
        )
        .unwrap()
        .capture(&[1.0; ACTION_DIM]);
        let t = FrameTranslator::new(frame, JointLimits::default());
        let p = [0.5, 1.5, -0.5, 0.1, 0.2, 0.3, 0.4];
        assert_relative_eq!(t.to_physical(&p)[0], -0.5);
        assert_eq!(t.to_physical(&t.to_policy(&p)), p);
    }

    #[test]
    fn test_policy_zero_is_power_on_pose() {
        let t = calibrated();
        let physical = t.to_physical(&[0.0; ACTION_DIM]);
        assert_eq!(physical, t.calibration().zero_offset);
        assert_eq!(physical[GRIPPER], 0.0);
    }

    #[test]
    fn test_command_is_clamped() {
        let t = FrameTranslator::default();
        let cmd = t.command(&[0.0, 0.0, 0.0, 100.0, 0.0, 0.0, -3.0]);
        assert_relative_eq!(cmd.target[3], 1.2);
        assert_relative_eq!(cmd.target[GRIPPER], 0.0);
        assert_eq!(cmd.report.len(), 2);
        assert!(t.limits().contains(&cmd.target));
    }

    #[test]
    fn test_sign_flip_is_self_inverse() {
        let t = calibrated();
        let policy = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];
        let there = t.to_physical(&policy);
        let back = t.to_policy(&there);
        for i in 0..ACTION_DIM {
            assert_relative_eq!(back[i], policy[i], epsilon = 1e-12);
        }
    }
}

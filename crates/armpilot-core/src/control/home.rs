//! Home maneuvers
//!
//! Both maneuvers go through [`FrameTranslator`] so the clamp is the last
//! transform before the bus, same as policy output.

use std::time::Duration;

use super::{interpolator, Sleeper};
use crate::frame::FrameTranslator;
use crate::hardware::{Joints, SharedArm, ACTION_DIM, GRIPPER};
use crate::{Error, Result};

/// Operator pause: command the calibrated zero repeatedly at a slow sub-rate
#[derive(Debug, Clone, Copy)]
pub struct HomeManeuver {
    pub iterations: u32,
    pub rate_hz: f64,
}

impl Default for HomeManeuver {
    fn default() -> Self {
        Self {
            iterations: 20,
            rate_hz: 20.0,
        }
    }
}

impl HomeManeuver {
    /// Run to completion; returns the number of commands the arm accepted
    ///
    /// Bus errors are logged and the remaining iterations still run.
    pub fn run(
        &self,
        arm: &SharedArm,
        translator: &FrameTranslator,
        sleeper: &mut dyn Sleeper,
    ) -> u32 {
        let home = translator.command(&[0.0; ACTION_DIM]);
        if !home.report.is_empty() {
            tracing::warn!("Home pose outside joint limits, clamped: {}", home.report);
        }
        let period = Duration::from_secs_f64(1.0 / self.rate_hz);

        tracing::info!("Homing ({} iterations at {} Hz)", self.iterations, self.rate_hz);
        let mut sent = 0;
        for _ in 0..self.iterations {
            match arm.send_action(&home.target) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Home command skipped: {}", e),
            }
            sleeper.sleep(period);
        }
        sent
    }
}

/// Shutdown: glide from the current pose to the calibrated zero
///
/// When the starting pose cannot be read after `read_attempts` tries, the
/// zero pose is commanded repeatedly instead, like [`HomeManeuver`].
#[derive(Debug, Clone, Copy)]
pub struct ShutdownHome {
    pub steps: u32,
    pub rate_hz: f64,
    pub read_attempts: u32,
}

impl Default for ShutdownHome {
    fn default() -> Self {
        Self {
            steps: 100,
            rate_hz: 50.0,
            read_attempts: 3,
        }
    }
}

impl ShutdownHome {
    /// Best-effort; fails only if the arm accepted no command at all
    ///
    /// The gripper is held at its current opening throughout the glide.
    pub fn run(
        &self,
        arm: &SharedArm,
        translator: &FrameTranslator,
        sleeper: &mut dyn Sleeper,
    ) -> Result<()> {
        let period = Duration::from_secs_f64(1.0 / self.rate_hz);
        let mut last_err = None;
        for attempt in 1..=self.read_attempts.max(1) {
            match arm.observation() {
                Ok(obs) => return self.glide(arm, translator, obs.state, period, sleeper),
                Err(e) => {
                    tracing::warn!("Shutdown home read {} failed: {}", attempt, e);
                    last_err = Some(e);
                    sleeper.sleep(period);
                }
            }
        }

        tracing::warn!("Current pose unknown, commanding zero directly");
        let fallback = HomeManeuver {
            iterations: self.steps.min(HomeManeuver::default().iterations),
            rate_hz: self.rate_hz,
        };
        if fallback.run(arm, translator, sleeper) > 0 {
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| Error::Hardware("shutdown home sent nothing".into())))
    }

    fn glide(
        &self,
        arm: &SharedArm,
        translator: &FrameTranslator,
        current: Joints,
        period: Duration,
        sleeper: &mut dyn Sleeper,
    ) -> Result<()> {
        let mut target = translator.to_physical(&[0.0; ACTION_DIM]);
        target[GRIPPER] = current[GRIPPER];

        tracing::info!("Returning to zero over {} steps", self.steps);
        let mut failures = 0u32;
        for pose in interpolator::ramp(&current, &target, self.steps as usize) {
            let (safe, _) = translator.clamp(&pose);
            if let Err(e) = arm.send_action(&safe) {
                failures += 1;
                tracing::debug!("Shutdown home step failed: {}", e);
            }
            sleeper.sleep(period);
        }
        if failures > 0 {
            tracing::warn!("Shutdown home: {} of {} steps failed", failures, self.steps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RecordingSleeper;
    use crate::frame::{CalibrationFrame, JointLimits, ZeroConvention};
    use crate::hardware::{HardwareAdapter, SimArm};
    use approx::assert_relative_eq;

    fn calibrated(pose: [f64; 7]) -> FrameTranslator {
        let frame = CalibrationFrame::new(
            "test",
            [1.0; 7],
            [1.0; 7],
            ZeroConvention::RelativePowerOn,
        )
        .unwrap()
        .capture(&pose);
        FrameTranslator::new(frame, JointLimits::default())
    }

    #[test]
    fn test_home_maneuver_commands_zero_pose() {
        let mut sim = SimArm::new();
        sim.connect().unwrap();
        let probe = sim.probe();
        let arm = SharedArm::new(sim);
        let translator = calibrated([0.5, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let mut sleeper = RecordingSleeper::default();

        let sent = HomeManeuver::default().run(&arm, &translator, &mut sleeper);
        assert_eq!(sent, 20);
        let commands = probe.commands();
        assert_eq!(commands.len(), 20);
        assert!(commands
            .iter()
            .all(|c| c == &[0.5, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]));
        let sleeps = sleeper.sleeps.lock();
        assert_eq!(sleeps.len(), 20);
        assert_eq!(sleeps[0], Duration::from_millis(50));
    }

    #[test]
    fn test_home_maneuver_survives_bus_errors() {
        let mut sim = SimArm::new();
        sim.connect().unwrap();
        let probe = sim.probe();
        probe.fail_next_writes(3);
        let arm = SharedArm::new(sim);

        let sent = HomeManeuver::default().run(
            &arm,
            &FrameTranslator::default(),
            &mut RecordingSleeper::default(),
        );
        assert_eq!(sent, 17);
    }

    #[test]
    fn test_home_maneuver_is_clamped() {
        let mut sim = SimArm::new();
        sim.connect().unwrap();
        let probe = sim.probe();
        let arm = SharedArm::new(sim);
        // zero captured outside the J4 interval
        let translator = calibrated([0.0, 0.5, 0.5, 2.5, 0.0, 0.0, 0.0]);

        HomeManeuver {
            iterations: 1,
            rate_hz: 20.0,
        }
        .run(&arm, &translator, &mut RecordingSleeper::default());
        assert_eq!(probe.commands()[0][3], 1.2);
    }

    #[test]
    fn test_shutdown_home_glides_to_zero() {
        let start = [1.0, 2.0, 1.5, -1.0, 0.3, -1.0, 0.7];
        let mut sim = SimArm::new().with_initial_pose(start);
        sim.connect().unwrap();
        let probe = sim.probe();
        let arm = SharedArm::new(sim);
        let translator = calibrated([0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);

        ShutdownHome::default()
            .run(&arm, &translator, &mut RecordingSleeper::default())
            .unwrap();

        let commands = probe.commands();
        assert_eq!(commands.len(), 100);
        let last = commands[99];
        assert_relative_eq!(last[0], 0.0);
        assert_relative_eq!(last[1], 0.5);
        assert_relative_eq!(last[2], 0.5);
        assert!(commands.iter().all(|c| c[GRIPPER] == 0.7));
        assert!(commands.iter().all(|c| translator.limits().contains(c)));
    }

    #[test]
    fn test_shutdown_home_retries_a_failed_read() {
        let start = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.4];
        let mut sim = SimArm::new().with_initial_pose(start);
        sim.connect().unwrap();
        let probe = sim.probe();
        probe.fail_next_reads(1);
        let arm = SharedArm::new(sim);

        ShutdownHome::default()
            .run(&arm, &FrameTranslator::default(), &mut RecordingSleeper::default())
            .unwrap();

        let commands = probe.commands();
        assert_eq!(commands.len(), 100);
        assert_relative_eq!(commands[0][0], 0.99);
        assert_relative_eq!(commands[99][0], 0.0);
        assert!(commands.iter().all(|c| c[GRIPPER] == 0.4));
    }

    #[test]
    fn test_shutdown_home_falls_back_to_zero_without_a_reading() {
        let mut sim = SimArm::new();
        sim.connect().unwrap();
        let probe = sim.probe();
        probe.fail_next_reads(3);
        let arm = SharedArm::new(sim);
        let translator = calibrated([0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        let mut sleeper = RecordingSleeper::default();

        ShutdownHome::default()
            .run(&arm, &translator, &mut sleeper)
            .unwrap();

        let commands = probe.commands();
        assert_eq!(commands.len(), 20);
        assert!(commands
            .iter()
            .all(|c| c == &[0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]));
        // 3 read retries + 20 commands, all at the shutdown rate
        let sleeps = sleeper.sleeps.lock();
        assert_eq!(sleeps.len(), 23);
        assert!(sleeps.iter().all(|d| *d == Duration::from_millis(20)));
    }

    #[test]
    fn test_shutdown_home_fails_when_arm_is_unreachable() {
        let sim = SimArm::new();
        let arm = SharedArm::new(sim);
        assert!(ShutdownHome::default()
            .run(&arm, &FrameTranslator::default(), &mut RecordingSleeper::default())
            .is_err());
    }
}

//! Outer loop: connect, run episodes with retry, always shut down cleanly

use crate::config::PilotConfig;
use crate::control::{EpisodeOutcome, EpisodeRunner, InputSource, ObservationObserver, Sleeper};
use crate::frame::{CalibrationFrame, FrameTranslator};
use crate::hardware::{SharedArm, NUM_ARM_JOINTS};
use crate::policy::{ChunkBroker, Policy};
use crate::{Error, Result};

/// What a [`Runtime::run`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Episodes started
    pub episodes: u32,
    pub completed: u32,
    /// Episodes ended by an operator reset
    pub resets: u32,
    /// Episodes aborted by a transport or shape error
    pub failures: u32,
    /// Whether the operator quit
    pub quit: bool,
}

/// Owns the episode runner and the process lifecycle around it
pub struct Runtime<P> {
    config: PilotConfig,
    calibration: CalibrationFrame,
    runner: EpisodeRunner<P>,
}

impl<P: Policy> Runtime<P> {
    /// Validate the configuration and assemble the pipeline
    pub fn new(
        config: PilotConfig,
        policy: P,
        arm: SharedArm,
        input: Box<dyn InputSource>,
    ) -> Result<Self> {
        config.validate()?;
        let calibration = config.calibration.frame()?;
        let broker = ChunkBroker::new(policy, config.episode.action_horizon)?;
        let translator = FrameTranslator::new(calibration.clone(), config.limits.clone());
        let runner = EpisodeRunner::new(
            broker,
            arm,
            translator,
            config.episode.loop_config(),
            config.episode.settings(),
        )
        .with_input(input)
        .with_home(config.home.maneuver());

        Ok(Self {
            config,
            calibration,
            runner,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn ObservationObserver>) -> Self {
        self.runner = self.runner.with_observer(observer);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.runner = self.runner.with_sleeper(sleeper);
        self
    }

    /// Connect the arm and capture the calibration zero from its first reading
    pub fn connect(&mut self) -> Result<()> {
        let arm = self.runner.arm().clone();
        arm.connect()?;
        let reading = arm.observation()?;
        let frame = self.calibration.capture(&reading.state);
        tracing::info!(
            "Connected to {} arm; calibration {} ({:?}), zero {:?}",
            arm.name(),
            frame.version,
            frame.convention,
            &frame.zero_offset[..NUM_ARM_JOINTS]
        );
        let limits = self.runner.translator().limits().clone();
        self.runner.set_translator(FrameTranslator::new(frame, limits));
        Ok(())
    }

    /// Run every configured episode, then home and release the hardware
    ///
    /// Shutdown runs whether the episodes finished, the operator quit, or an
    /// error ended the run.
    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_episodes();
        self.shutdown();
        match &result {
            Ok(summary) => tracing::info!("Run finished: {:?}", summary),
            Err(e) => tracing::error!("Run failed: {}", e),
        }
        result
    }

    fn run_episodes(&mut self) -> Result<RunSummary> {
        self.connect()?;
        let metadata = self.runner.broker_mut().metadata()?;
        tracing::info!(
            "Policy server metadata: {}",
            serde_json::Value::Object(metadata)
        );

        let episode = self.config.episode.clone();
        let mut summary = RunSummary::default();
        let mut consecutive_failures = 0;

        for index in 0..episode.num_episodes {
            summary.episodes += 1;
            match self.runner.run_episode(index) {
                Ok(EpisodeOutcome::Completed) => {
                    summary.completed += 1;
                    consecutive_failures = 0;
                }
                Ok(EpisodeOutcome::Reset) => {
                    summary.resets += 1;
                    consecutive_failures = 0;
                }
                Ok(EpisodeOutcome::Quit) => {
                    summary.quit = true;
                    break;
                }
                Err(e @ (Error::Transport(_) | Error::Shape(_))) => {
                    summary.failures += 1;
                    consecutive_failures += 1;
                    if consecutive_failures >= episode.max_consecutive_failures {
                        tracing::error!(
                            "Giving up after {} consecutive failed episodes",
                            consecutive_failures
                        );
                        return Err(e);
                    }
                    tracing::warn!(
                        "Episode {} failed ({}); retrying in {:?}",
                        index,
                        e,
                        episode.retry_backoff()
                    );
                    self.runner.broker_mut().clear();
                    self.runner.sleep(episode.retry_backoff());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    fn shutdown(&mut self) {
        self.runner.restore_input();
        let arm = self.runner.arm().clone();
        if !arm.is_connected() {
            return;
        }
        if let Err(e) = self.runner.shutdown_home(&self.config.home.shutdown()) {
            tracing::warn!("Shutdown home failed: {}", e);
        }
        if let Err(e) = arm.close() {
            tracing::warn!("Closing {} arm failed: {}", arm.name(), e);
        }
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    pub fn runner(&self) -> &EpisodeRunner<P> {
        &self.runner
    }
}

//! The per-episode control loop
//!
//! ```text
//! poll operator → OBSERVE → INFER_OR_CACHE → [BRIDGE if new chunk] → ACTUATE → SLEEP_TO_PERIOD
//! ```
//!
//! Operator reset and quit come back as [`EpisodeOutcome`] values through
//! every level of the loop; nothing unwinds by panicking or by error.

use std::sync::Arc;

use super::{
    interpolator, ControlLoopConfig, ControlLoopStats, ControllerState, HomeManeuver,
    InputSource, NoInput, ObservationObserver, OperatorAction, OperatorStateMachine,
    ShutdownHome, Sleeper, ThreadSleeper, TickTimer,
};
use crate::frame::FrameTranslator;
use crate::hardware::{Joints, SharedArm};
use crate::math::max_arm_deviation;
use crate::policy::{ChunkBroker, Observation, Policy};
use crate::Result;

/// How an episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOutcome {
    /// Ran to its step limit
    Completed,
    /// Operator resumed from pause; start a fresh episode
    Reset,
    /// Operator asked to exit
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Reset,
    Quit,
}

/// Per-episode behavior knobs
#[derive(Debug, Clone)]
pub struct EpisodeSettings {
    /// Task prompt attached to every observation
    pub prompt: Arc<str>,
    /// Bridge sub-steps at a chunk boundary (0 disables smoothing)
    pub interpolation_steps: usize,
    /// Control ticks per episode; `None` runs until the operator intervenes
    pub max_steps: Option<u64>,
    /// Commanded/observed arm deviation that triggers a warning (radians)
    pub deviation_warn_rad: f64,
    /// Deviation check cadence in ticks
    pub deviation_log_every: u64,
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self {
            prompt: "pick up the small cube and place it in the box".into(),
            interpolation_steps: 15,
            max_steps: None,
            deviation_warn_rad: 0.5,
            deviation_log_every: 10,
        }
    }
}

/// Drives one episode at a time against a broker and an arm
pub struct EpisodeRunner<P> {
    broker: ChunkBroker<P>,
    arm: SharedArm,
    translator: FrameTranslator,
    operator: OperatorStateMachine,
    input: Box<dyn InputSource>,
    observer: Option<Box<dyn ObservationObserver>>,
    sleeper: Box<dyn Sleeper>,
    settings: EpisodeSettings,
    home: HomeManeuver,
    timer: TickTimer,
    /// Policy-frame pose of the last command the arm accepted
    last_commanded: Option<Joints>,
    ticks: u64,
    clamp_events: u64,
    hardware_skips: u64,
    deviation_warnings: u64,
}

impl<P: Policy> EpisodeRunner<P> {
    pub fn new(
        broker: ChunkBroker<P>,
        arm: SharedArm,
        translator: FrameTranslator,
        loop_config: ControlLoopConfig,
        settings: EpisodeSettings,
    ) -> Self {
        Self {
            broker,
            arm,
            translator,
            operator: OperatorStateMachine::new(),
            input: Box::new(NoInput),
            observer: None,
            sleeper: Box::new(ThreadSleeper),
            settings,
            home: HomeManeuver::default(),
            timer: TickTimer::new(loop_config),
            last_commanded: None,
            ticks: 0,
            clamp_events: 0,
            hardware_skips: 0,
            deviation_warnings: 0,
        }
    }

    pub fn with_input(mut self, input: Box<dyn InputSource>) -> Self {
        self.input = input;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn ObservationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_home(mut self, home: HomeManeuver) -> Self {
        self.home = home;
        self
    }

    /// Clear per-episode state and the policy's context
    pub fn begin_episode(&mut self) -> Result<()> {
        self.broker.reset()?;
        self.operator.restart();
        self.last_commanded = None;
        self.ticks = 0;
        self.timer.reset_stats();
        Ok(())
    }

    /// Run one episode until completion, operator reset/quit, or a fatal error
    ///
    /// Transport and shape errors abort the episode. Hardware errors skip the
    /// affected tick. The broker cache never outlives the episode.
    pub fn run_episode(&mut self, index: u32) -> Result<EpisodeOutcome> {
        self.begin_episode()?;
        tracing::info!("Episode {} started: \"{}\"", index, self.settings.prompt);

        let result = self.run_ticks();
        self.broker.clear();

        let stats = *self.timer.stats();
        match &result {
            Ok(outcome) => tracing::info!("Episode {} ended ({:?}): {}", index, outcome, stats),
            Err(e) => tracing::error!("Episode {} aborted: {} ({})", index, e, stats),
        }
        result
    }

    fn run_ticks(&mut self) -> Result<EpisodeOutcome> {
        loop {
            if self.settings.max_steps.is_some_and(|max| self.ticks >= max) {
                return Ok(EpisodeOutcome::Completed);
            }
            match self.tick()? {
                Flow::Continue => {}
                Flow::Reset => return Ok(EpisodeOutcome::Reset),
                Flow::Quit => return Ok(EpisodeOutcome::Quit),
            }
        }
    }

    fn tick(&mut self) -> Result<Flow> {
        let flow = self.poll_operator();
        if flow != Flow::Continue {
            return Ok(flow);
        }
        self.timer.start();
        let tick = self.ticks;
        self.ticks += 1;

        let raw = match self.arm.observation() {
            Ok(raw) => raw,
            Err(e) if !e.aborts_episode() => {
                tracing::warn!("Tick {}: observation failed, skipping: {}", tick, e);
                self.hardware_skips += 1;
                self.timer.pace(self.sleeper.as_mut());
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };

        let observation = Observation {
            state: self.translator.to_policy(&raw.state),
            images: raw.images,
            prompt: Arc::clone(&self.settings.prompt),
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.observe(tick, &observation);
        }

        let step = self.broker.next_action(&observation)?;
        self.check_deviation(tick, &step.action, &observation.state);

        if step.new_chunk && self.settings.interpolation_steps > 0 {
            if let Some(last) = self.last_commanded {
                tracing::debug!(
                    "Bridging to new chunk over {} sub-steps",
                    self.settings.interpolation_steps
                );
                let bridge =
                    interpolator::bridge(&last, &step.action, self.settings.interpolation_steps);
                for pose in bridge {
                    self.actuate(&pose)?;
                    self.timer.pace(self.sleeper.as_mut());

                    let flow = self.poll_operator();
                    if flow != Flow::Continue {
                        return Ok(flow);
                    }
                    self.timer.start();
                }
            }
        }

        self.actuate(&step.action)?;
        self.timer.pace(self.sleeper.as_mut());
        Ok(Flow::Continue)
    }

    /// Drain pending operator signals; blocks here while paused
    fn poll_operator(&mut self) -> Flow {
        loop {
            while let Some(signal) = self.input.poll() {
                match self.operator.handle(signal) {
                    OperatorAction::Ignore => {}
                    OperatorAction::StartHoming => {
                        self.home.run(&self.arm, &self.translator, self.sleeper.as_mut());
                        self.operator.finish_homing();
                        tracing::info!("Paused at home; signal again to start a new episode");
                    }
                    OperatorAction::Reset => return Flow::Reset,
                    OperatorAction::Quit => return Flow::Quit,
                }
            }
            if self.operator.state() != ControllerState::Paused {
                return Flow::Continue;
            }
            self.sleeper.sleep(self.timer.period());
        }
    }

    /// Translate, clamp and send one policy-frame pose
    fn actuate(&mut self, pose: &Joints) -> Result<()> {
        let command = self.translator.command(pose);
        if !command.report.is_empty() {
            self.clamp_events += 1;
            tracing::warn!("Clamped command: {}", command.report);
        }
        match self.arm.send_action(&command.target) {
            Ok(()) => {
                self.last_commanded = Some(self.translator.to_policy(&command.target));
                Ok(())
            }
            Err(e) if !e.aborts_episode() => {
                self.hardware_skips += 1;
                tracing::warn!("Action skipped: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Compare the raw policy action with the observed pose, both in the policy frame
    fn check_deviation(&mut self, tick: u64, action: &Joints, observed: &Joints) {
        let every = self.settings.deviation_log_every;
        if every == 0 || tick % every != 0 {
            return;
        }
        tracing::info!(
            "Tick {}: act J1 {:.3} J2 {:.3} | obs J1 {:.3} J2 {:.3}",
            tick,
            action[0],
            action[1],
            observed[0],
            observed[1]
        );
        let deviation = max_arm_deviation(action, observed);
        if deviation > self.settings.deviation_warn_rad {
            self.deviation_warnings += 1;
            tracing::warn!(
                "Tick {}: policy action is {:.3} rad from the observed pose; check calibration",
                tick,
                deviation
            );
        }
    }

    /// Best-effort glide to zero, used on the way out
    pub fn shutdown_home(&mut self, maneuver: &ShutdownHome) -> Result<()> {
        maneuver.run(&self.arm, &self.translator, self.sleeper.as_mut())
    }

    /// Put the operator's terminal back the way it was
    pub fn restore_input(&mut self) {
        self.input.restore();
    }

    /// Pause for `duration` on the loop's sleeper
    pub fn sleep(&mut self, duration: std::time::Duration) {
        self.sleeper.sleep(duration);
    }

    pub fn arm(&self) -> &SharedArm {
        &self.arm
    }

    pub fn broker(&self) -> &ChunkBroker<P> {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut ChunkBroker<P> {
        &mut self.broker
    }

    pub fn translator(&self) -> &FrameTranslator {
        &self.translator
    }

    /// Install the calibration captured at (re)connect
    pub fn set_translator(&mut self, translator: FrameTranslator) {
        self.translator = translator;
    }

    pub fn operator_state(&self) -> ControllerState {
        self.operator.state()
    }

    pub fn stats(&self) -> &ControlLoopStats {
        self.timer.stats()
    }

    /// Control ticks in the current episode
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Commands the clamp had to correct, across all episodes
    pub fn clamp_events(&self) -> u64 {
        self.clamp_events
    }

    /// Reads or writes skipped after a bus error, across all episodes
    pub fn hardware_skips(&self) -> u64 {
        self.hardware_skips
    }

    /// Sampled ticks where the policy action strayed past `deviation_warn_rad`
    pub fn deviation_warnings(&self) -> u64 {
        self.deviation_warnings
    }

    pub fn last_commanded(&self) -> Option<&Joints> {
        self.last_commanded.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::control::RecordingSleeper;
    use crate::control::{ChannelInput, OperatorSignal};
    use crate::hardware::{HardwareAdapter, SimArm, SimProbe};
    use crate::policy::InferenceResult;
    use crate::Error;
    use crossbeam_channel::Sender;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type ChunkFn = Box<dyn FnMut(usize) -> Result<InferenceResult> + Send>;

    /// Policy whose `n`-th inference is produced by a closure
    pub(crate) struct ScriptedPolicy {
        make: ChunkFn,
        pub calls: Arc<AtomicUsize>,
        pub resets: Arc<AtomicUsize>,
    }

    impl ScriptedPolicy {
        pub(crate) fn new(make: impl FnMut(usize) -> Result<InferenceResult> + Send + 'static) -> Self {
            Self {
                make: Box::new(make),
                calls: Arc::new(AtomicUsize::new(0)),
                resets: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Every call returns `len` copies of `frame`
        pub(crate) fn constant(len: usize, frame: Joints) -> Self {
            Self::new(move |_| Ok(chunk_of(len, frame)))
        }
    }

    impl Policy for ScriptedPolicy {
        fn infer(&mut self, _obs: &Observation) -> Result<InferenceResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.make)(n)
        }

        fn reset(&mut self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn chunk_of(len: usize, frame: Joints) -> InferenceResult {
        let data = (0..len).flat_map(|_| frame).collect();
        InferenceResult::new(ArrayD::from_shape_vec(IxDyn(&[len, 7]), data).unwrap())
    }

    /// Sends scripted operator signals when a given tick is observed
    struct SignalAt {
        tick: u64,
        signals: Vec<OperatorSignal>,
        tx: Sender<OperatorSignal>,
    }

    impl ObservationObserver for SignalAt {
        fn observe(&mut self, tick: u64, _obs: &Observation) {
            if tick == self.tick {
                for s in self.signals.drain(..) {
                    self.tx.send(s).unwrap();
                }
            }
        }
    }

    fn connected_sim() -> (SharedArm, SimProbe) {
        let mut sim = SimArm::new();
        sim.connect().unwrap();
        let probe = sim.probe();
        (SharedArm::new(sim), probe)
    }

    fn runner(
        policy: ScriptedPolicy,
        horizon: usize,
        settings: EpisodeSettings,
    ) -> (EpisodeRunner<ScriptedPolicy>, SimProbe) {
        let (arm, probe) = connected_sim();
        let broker = ChunkBroker::new(policy, horizon).unwrap();
        let runner = EpisodeRunner::new(
            broker,
            arm,
            FrameTranslator::default(),
            ControlLoopConfig::new(10.0).with_overrun_warning(false),
            settings,
        )
        .with_sleeper(Box::new(RecordingSleeper::default()));
        (runner, probe)
    }

    fn steps(max: u64, interpolation_steps: usize) -> EpisodeSettings {
        EpisodeSettings {
            max_steps: Some(max),
            interpolation_steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_episode_plays_chunk_back_to_back() {
        let policy = ScriptedPolicy::constant(5, [0.1, 0.5, 0.5, 0.0, 0.0, 0.0, 1.0]);
        let calls = Arc::clone(&policy.calls);
        let (mut runner, probe) = runner(policy, 5, steps(5, 15));

        assert_eq!(runner.run_episode(0).unwrap(), EpisodeOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.command_count(), 5);
        assert_eq!(runner.stats().iterations, 5);
    }

    #[test]
    fn test_new_chunk_is_bridged() {
        let policy = ScriptedPolicy::new(|n| {
            let j1 = 0.1 * (n + 1) as f64;
            Ok(chunk_of(2, [j1, 0.0, 0.0, 0.0, 0.0, 0.0, n as f64]))
        });
        let (mut runner, probe) = runner(policy, 2, steps(4, 3));

        runner.run_episode(0).unwrap();
        let commands = probe.commands();
        // 2 frames, 3 bridge sub-steps, 2 frames
        assert_eq!(commands.len(), 7);
        let j1: Vec<f64> = commands.iter().map(|c| c[0]).collect();
        for (got, want) in j1.iter().zip([0.1, 0.1, 0.125, 0.15, 0.175, 0.2, 0.2]) {
            assert!((got - want).abs() < 1e-9, "{:?}", j1);
        }
        // gripper held through the bridge, snaps on the chunk frame
        assert_eq!(commands[4][6], 0.0);
        assert_eq!(commands[5][6], 1.0);
    }

    #[test]
    fn test_first_chunk_is_not_bridged() {
        let policy = ScriptedPolicy::constant(1, [0.3, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        let (mut runner, probe) = runner(policy, 1, steps(1, 15));
        runner.run_episode(0).unwrap();
        assert_eq!(probe.command_count(), 1);
    }

    #[test]
    fn test_reset_mid_chunk_unwinds_broker() {
        let policy = ScriptedPolicy::constant(10, [0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        let resets = Arc::clone(&policy.resets);
        let (tx, input) = ChannelInput::bounded(8);
        let (runner, probe) = runner(policy, 10, steps(100, 0));
        let mut runner = runner.with_input(Box::new(input)).with_observer(Box::new(SignalAt {
            tick: 2,
            signals: vec![OperatorSignal::TogglePause, OperatorSignal::TogglePause],
            tx,
        }));

        assert_eq!(runner.run_episode(0).unwrap(), EpisodeOutcome::Reset);
        assert_eq!(runner.broker().cursor(), 0);
        assert!(!runner.broker().has_chunk());
        assert_eq!(runner.operator_state(), ControllerState::Running);
        // three ticks played, then the 20-command home maneuver
        assert_eq!(probe.command_count(), 3 + 20);

        runner.begin_episode().unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_quit_ends_episode() {
        let policy = ScriptedPolicy::constant(10, [0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        let (tx, input) = ChannelInput::bounded(8);
        let (runner, probe) = runner(policy, 10, steps(100, 0));
        let mut runner = runner.with_input(Box::new(input)).with_observer(Box::new(SignalAt {
            tick: 1,
            signals: vec![OperatorSignal::Quit],
            tx,
        }));

        assert_eq!(runner.run_episode(0).unwrap(), EpisodeOutcome::Quit);
        assert_eq!(probe.command_count(), 2);
    }

    #[test]
    fn test_hardware_errors_skip_tick() {
        let policy = ScriptedPolicy::constant(10, [0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
        let calls = Arc::clone(&policy.calls);
        let (mut runner, probe) = runner(policy, 10, steps(4, 0));
        probe.fail_next_reads(1);
        probe.fail_next_writes(1);

        assert_eq!(runner.run_episode(0).unwrap(), EpisodeOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // tick 0 skipped on read, tick 1's write dropped
        assert_eq!(probe.command_count(), 2);
        assert_eq!(runner.hardware_skips(), 2);
    }

    #[test]
    fn test_transport_error_aborts_episode() {
        let policy = ScriptedPolicy::new(|_| Err(Error::Transport("timed out".into())));
        let (mut runner, probe) = runner(policy, 10, steps(10, 0));
        assert!(matches!(runner.run_episode(0), Err(Error::Transport(_))));
        assert_eq!(probe.command_count(), 0);
    }

    #[test]
    fn test_out_of_range_command_is_clamped() {
        let policy = ScriptedPolicy::constant(1, [0.0, 0.5, 0.5, 100.0, 0.0, 0.0, 2.0]);
        let (mut runner, probe) = runner(policy, 1, steps(1, 0));
        runner.run_episode(0).unwrap();

        let sent = probe.commands()[0];
        assert_eq!(sent[3], 1.2);
        assert_eq!(sent[6], 1.0);
        assert_eq!(runner.clamp_events(), 1);
    }

    #[test]
    fn test_deviation_tracks_policy_action_not_clamped_command() {
        // J5 is asked for 2.0 but limited to 0.4, so the arm never gets there
        let policy = ScriptedPolicy::constant(1, [0.0, 0.3, 0.3, 0.0, 2.0, 0.0, 0.0]);
        let (mut strayed, _) = runner(policy, 1, steps(11, 0));
        strayed.run_episode(0).unwrap();
        assert_eq!(strayed.deviation_warnings(), 2);

        let policy = ScriptedPolicy::constant(1, [0.0, 0.3, 0.3, 0.0, 0.2, 0.0, 0.0]);
        let (mut tracking, _) = runner(policy, 1, steps(11, 0));
        tracking.run_episode(0).unwrap();
        assert_eq!(tracking.deviation_warnings(), 0);
    }

    #[test]
    fn test_observation_is_in_policy_frame() {
        use crate::frame::{CalibrationFrame, JointLimits, ZeroConvention};

        struct Capture(Arc<parking_lot::Mutex<Vec<Joints>>>);
        impl ObservationObserver for Capture {
            fn observe(&mut self, _tick: u64, obs: &Observation) {
                self.0.lock().push(obs.state);
            }
        }

        let power_on = [0.2, 1.0, 1.0, 0.0, 0.0, 0.0, 0.4];
        let mut sim = SimArm::new().with_initial_pose(power_on);
        sim.connect().unwrap();
        let frame = CalibrationFrame::new("t", [1.0; 7], [1.0; 7], ZeroConvention::RelativePowerOn)
            .unwrap()
            .capture(&power_on);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let broker = ChunkBroker::new(ScriptedPolicy::constant(1, [0.0; 7]), 1).unwrap();
        let mut runner = EpisodeRunner::new(
            broker,
            SharedArm::new(sim),
            FrameTranslator::new(frame, JointLimits::default()),
            ControlLoopConfig::new(10.0),
            steps(1, 0),
        )
        .with_sleeper(Box::new(RecordingSleeper::default()))
        .with_observer(Box::new(Capture(Arc::clone(&seen))));

        runner.run_episode(0).unwrap();
        assert_eq!(seen.lock()[0], [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.4]);
    }
}

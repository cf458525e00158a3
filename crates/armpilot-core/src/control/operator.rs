//! Operator interrupt state machine and input sources
//!
//! ```text
//!   RUNNING ──pause──► HOMING ──done──► PAUSED ──resume──► RUNNING (+ reset)
//!      └────────────── quit (any state) ─────────────────► EXIT
//! ```

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

/// Controller mode, read by the episode loop once per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Policy drives the arm
    #[default]
    Running,
    /// Arm held at home, waiting for the operator
    Paused,
    /// Home maneuver in progress
    Homing,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControllerState::Running => "RUNNING",
            ControllerState::Paused => "PAUSED",
            ControllerState::Homing => "HOMING",
        };
        f.write_str(name)
    }
}

/// A single-key operator signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorSignal {
    /// Pause and home while running; resume with a fresh episode while paused
    TogglePause,
    /// Terminate the process
    Quit,
}

/// What the loop must do in response to a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    /// Nothing changes
    Ignore,
    /// Run the home maneuver, then call [`OperatorStateMachine::finish_homing`]
    StartHoming,
    /// Unwind the current episode and start a fresh one
    Reset,
    /// Unwind everything and exit
    Quit,
}

/// Operator interrupt state machine
#[derive(Debug, Default)]
pub struct OperatorStateMachine {
    state: ControllerState,
}

impl OperatorStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Apply a signal
    pub fn handle(&mut self, signal: OperatorSignal) -> OperatorAction {
        match (self.state, signal) {
            (_, OperatorSignal::Quit) => {
                tracing::info!("Quit requested in state {}", self.state);
                OperatorAction::Quit
            }
            (ControllerState::Running, OperatorSignal::TogglePause) => {
                self.transition(ControllerState::Homing);
                OperatorAction::StartHoming
            }
            (ControllerState::Homing, OperatorSignal::TogglePause) => {
                tracing::debug!("Ignoring pause signal while homing");
                OperatorAction::Ignore
            }
            (ControllerState::Paused, OperatorSignal::TogglePause) => {
                self.transition(ControllerState::Running);
                OperatorAction::Reset
            }
        }
    }

    /// Home maneuver completed
    pub fn finish_homing(&mut self) {
        if self.state == ControllerState::Homing {
            self.transition(ControllerState::Paused);
        }
    }

    /// Force back to RUNNING at the start of an episode
    pub fn restart(&mut self) {
        if self.state != ControllerState::Running {
            self.transition(ControllerState::Running);
        }
    }

    fn transition(&mut self, next: ControllerState) {
        self.state = next;
        tracing::debug!("State transition: -> {}", next);
    }
}

/// Non-blocking source of operator signals
pub trait InputSource: Send {
    /// Return a pending signal, or `None` immediately
    fn poll(&mut self) -> Option<OperatorSignal>;

    /// Undo any terminal/input mode changes; called once before exit
    fn restore(&mut self) {}
}

/// Headless deployments: never produces a signal
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl InputSource for NoInput {
    fn poll(&mut self) -> Option<OperatorSignal> {
        None
    }
}

/// Signals produced on another thread, drained over a bounded channel
#[derive(Debug)]
pub struct ChannelInput {
    rx: Receiver<OperatorSignal>,
    disconnected: bool,
}

impl ChannelInput {
    /// Create a channel pair; the sender goes to the input thread
    pub fn bounded(capacity: usize) -> (Sender<OperatorSignal>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            tx,
            Self {
                rx,
                disconnected: false,
            },
        )
    }
}

impl InputSource for ChannelInput {
    fn poll(&mut self) -> Option<OperatorSignal> {
        match self.rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if !self.disconnected {
                    tracing::warn!("Operator input channel closed; no further signals");
                    self.disconnected = true;
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_home_resume_cycle() {
        let mut sm = OperatorStateMachine::new();
        assert_eq!(sm.state(), ControllerState::Running);

        assert_eq!(sm.handle(OperatorSignal::TogglePause), OperatorAction::StartHoming);
        assert_eq!(sm.state(), ControllerState::Homing);

        assert_eq!(sm.handle(OperatorSignal::TogglePause), OperatorAction::Ignore);
        assert_eq!(sm.state(), ControllerState::Homing);

        sm.finish_homing();
        assert_eq!(sm.state(), ControllerState::Paused);

        assert_eq!(sm.handle(OperatorSignal::TogglePause), OperatorAction::Reset);
        assert_eq!(sm.state(), ControllerState::Running);
    }

    #[test]
    fn test_quit_from_every_state() {
        for state in [
            ControllerState::Running,
            ControllerState::Paused,
            ControllerState::Homing,
        ] {
            let mut sm = OperatorStateMachine { state };
            assert_eq!(sm.handle(OperatorSignal::Quit), OperatorAction::Quit);
        }
    }

    #[test]
    fn test_finish_homing_only_from_homing() {
        let mut sm = OperatorStateMachine::new();
        sm.finish_homing();
        assert_eq!(sm.state(), ControllerState::Running);
    }

    #[test]
    fn test_channel_input_drains_without_blocking() {
        let (tx, mut input) = ChannelInput::bounded(4);
        assert_eq!(input.poll(), None);

        tx.send(OperatorSignal::TogglePause).unwrap();
        tx.send(OperatorSignal::Quit).unwrap();
        assert_eq!(input.poll(), Some(OperatorSignal::TogglePause));
        assert_eq!(input.poll(), Some(OperatorSignal::Quit));
        assert_eq!(input.poll(), None);

        drop(tx);
        assert_eq!(input.poll(), None);
        assert!(input.disconnected);
    }
}

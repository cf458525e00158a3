//! Control loop, chunk-boundary smoothing, operator interrupts and homing
//!
//! [`EpisodeRunner`] composes everything here with the chunk broker and the
//! frame translator into the per-episode loop.

mod control_loop;
mod episode;
pub mod interpolator;
mod home;
mod observer;
mod operator;

pub use control_loop::{ControlLoopConfig, ControlLoopStats, Sleeper, ThreadSleeper, TickTimer};
pub use episode::{EpisodeOutcome, EpisodeRunner, EpisodeSettings};
pub use home::{HomeManeuver, ShutdownHome};
pub use observer::{ChannelObserver, ObservationObserver, ObservedTick};
pub use operator::{
    ChannelInput, ControllerState, InputSource, NoInput, OperatorAction, OperatorSignal,
    OperatorStateMachine,
};

#[cfg(test)]
pub(crate) use control_loop::tests::RecordingSleeper;
#[cfg(test)]
pub(crate) use episode::tests::{chunk_of, ScriptedPolicy};

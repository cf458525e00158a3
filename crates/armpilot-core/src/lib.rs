//! armpilot-core: chunked-action execution for policy-driven robot arms
//!
//! Streams joint/camera observations to a remote policy, receives chunked
//! action sequences back, and actuates a 6-DOF arm plus gripper at a fixed
//! control rate while enforcing joint limits and operator override.
//!
//! # Modules
//!
//! - [`policy`] - Policy collaborator interface, chunk broker, websocket client
//! - [`frame`] - Calibration, sim/real frame translation, safety clamp
//! - [`control`] - Control loop, interpolation, operator state machine, homing
//! - [`hardware`] - Hardware adapter interface and arm backends
//! - [`config`] - Process configuration
//! - [`runtime`] - Outer episode/retry loop composing everything above
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  Observation   ┌──────────────┐  infer()   ┌──────────┐
//!  │ Hardware │──────────────► │ Chunk Broker │──────────► │  Policy  │
//!  │ Adapter  │                └──────┬───────┘ ◄──────────│ (remote) │
//!  └────▲─────┘                       │ one frame  chunk   └──────────┘
//!       │ clamped target     ┌────────▼────────┐
//!       └────────────────────│ Interpolator +  │◄── operator signals
//!                            │ Frame Translator│
//!                            └─────────────────┘
//! ```

#![warn(unused_must_use)]

pub mod config;
pub mod control;
pub mod frame;
pub mod hardware;
pub mod math;
pub mod policy;
pub mod runtime;

// Re-exports for convenience
pub use config::PilotConfig;
pub use control::{
    ControlLoopConfig, ControlLoopStats, ControllerState, EpisodeOutcome, EpisodeRunner,
    OperatorSignal, OperatorStateMachine,
};
pub use frame::{CalibrationFrame, ClampReport, FrameTranslator, JointLimits, ZeroConvention};
pub use hardware::{Frame, HardwareAdapter, Joints, RawObservation, SharedArm, SimArm};
pub use policy::{ChunkBroker, InferenceResult, Observation, Policy, PolicyField, StepAction};
pub use runtime::{RunSummary, Runtime};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for armpilot-core
///
/// Operator reset and quit are not errors; they surface as
/// [`EpisodeOutcome`] values. Clamping is never an error either.
///
/// # Example
/// ```ignore
/// match broker.next_action(&obs) {
///     Ok(step) => { /* actuate */ },
///     Err(Error::Transport(msg)) => tracing::error!("policy unreachable: {}", msg),
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Debug, thiserror::Error)]
#[must_use = "errors must be handled or explicitly ignored with let _ = ..."]
#[non_exhaustive]
pub enum Error {
    /// Policy server unreachable, timed out, or replied with garbage.
    /// Handle by: aborting the episode and retrying at the outer level.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bus read/write failure from the arm.
    /// Handle by: skipping this tick's action, retrying next tick.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Policy output whose shape could not be normalized into a chunk.
    /// Handle by: treating as a transport-level failure of that inference.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Invalid configuration parameter.
    /// Handle by: validating config before use, checking parameter ranges.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in invalid state (e.g., commanding a closed arm).
    /// Handle by: connecting before use.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Communication channel was closed unexpectedly.
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Whether the error should abort the current episode rather than skip a tick
    pub fn aborts_episode(&self) -> bool {
        !matches!(self, Error::Hardware(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Hardware(format!("I/O error: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Transport(format!("JSON error: {}", e))
    }
}

/// Result type alias for armpilot-core operations
pub type Result<T> = std::result::Result<T, Error>;

//! Sim/policy ↔ physical frame translation and the final safety clamp
//!
//! Every outgoing command, whatever produced it (policy playback, chunk
//! bridging, homing), passes through [`FrameTranslator::command`] so the
//! clamp is always the last transform before the hardware adapter.

mod calibration;
mod limits;
mod translator;

pub use calibration::{CalibrationFrame, GripperRange, ZeroConvention};
pub use limits::{ClampReport, JointInterval, JointLimits};
pub use translator::{FrameTranslator, SafeCommand};

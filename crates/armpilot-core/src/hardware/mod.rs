//! Hardware abstraction for the 6-DOF arm plus gripper
//!
//! The core never talks to the motor bus directly: it reads joint positions
//! and writes joint targets through [`HardwareAdapter`]. Two backends ship
//! with the crate: an in-process [`SimArm`] and (feature `hardware-feetech`)
//! a Feetech serial-bus arm.

#[cfg(feature = "hardware-feetech")]
pub mod feetech;
mod sim;
mod traits;

#[cfg(feature = "hardware-feetech")]
pub use feetech::{FeetechArm, FeetechConfig};
pub use sim::{SimArm, SimProbe};
pub use traits::{Frame, HardwareAdapter, RawObservation, SharedArm};

/// Number of rotational arm joints
pub const NUM_ARM_JOINTS: usize = 6;

/// Length of a joint-state / action vector (arm joints + gripper)
pub const ACTION_DIM: usize = NUM_ARM_JOINTS + 1;

/// Index of the gripper channel
pub const GRIPPER: usize = NUM_ARM_JOINTS;

/// One joint-state or action vector: radians for joints, [0, 1] for the gripper
pub type Joints = [f64; ACTION_DIM];

/// Joint names, in vector order
pub const JOINT_NAMES: [&str; ACTION_DIM] = [
    "joint_1", "joint_2", "joint_3", "joint_4", "joint_5", "joint_6", "gripper",
];

//! Feetech serial-bus arm adapter
//!
//! Seven STS servos (six arm joints plus the gripper) on one half-duplex
//! serial bus. Joint readings are converted to radians; the gripper servo's
//! angle is mapped onto [0, 1] through the configured [`GripperRange`].
//!
//! # Example
//!
//! ```no_run
//! use armpilot_core::hardware::{FeetechArm, FeetechConfig, HardwareAdapter};
//!
//! let mut arm = FeetechArm::new(FeetechConfig::new("/dev/ttyACM0"))?;
//! arm.connect()?;
//! let obs = arm.observation()?;
//! println!("state: {:?}", obs.state);
//! arm.close()?;
//! # Ok::<(), armpilot_core::Error>(())
//! ```

pub mod protocol;

use std::time::Duration;

use arrayvec::ArrayVec;
use serialport::SerialPort;

use super::{HardwareAdapter, Joints, RawObservation, ACTION_DIM, GRIPPER};
use crate::frame::GripperRange;
use crate::{Error, Result};
use protocol::{radians_to_step, step_to_radians, FeetechBus, MAX_STEP};

/// Configuration for a Feetech-bus arm
#[derive(Debug, Clone)]
pub struct FeetechConfig {
    /// Serial port path (e.g., "/dev/ttyACM0")
    pub port: String,
    /// Baud rate (default: 1,000,000)
    pub baudrate: u32,
    /// Servo IDs in joint order, gripper last
    pub servo_ids: [u8; ACTION_DIM],
    /// Gripper encoder travel
    pub gripper: GripperRange,
    /// Per-reply read timeout
    pub timeout: Duration,
}

impl FeetechConfig {
    /// Default baud rate (1 Mbps)
    pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

    /// Create a config for the given port with default servo IDs 1..=7
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baudrate: Self::DEFAULT_BAUDRATE,
            servo_ids: [1, 2, 3, 4, 5, 6, 7],
            gripper: GripperRange::default(),
            timeout: Duration::from_millis(100),
        }
    }

    /// Set the baud rate
    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    /// Set the gripper encoder travel
    pub fn with_gripper(mut self, gripper: GripperRange) -> Self {
        self.gripper = gripper;
        self
    }

    /// Reject a gripper travel the single-turn encoder cannot reach
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = (step_to_radians(0), step_to_radians(MAX_STEP));
        if !self.gripper.fits(lo, hi) || self.gripper.open == self.gripper.closed {
            return Err(Error::Config(format!(
                "gripper travel {} / {} rad outside servo range [{:.3}, {:.3}]",
                self.gripper.open, self.gripper.closed, lo, hi
            )));
        }
        Ok(())
    }
}

/// Arm adapter speaking the Feetech protocol over a serial port
pub struct FeetechArm {
    config: FeetechConfig,
    bus: Option<FeetechBus<Box<dyn SerialPort>>>,
}

impl FeetechArm {
    /// Create an unconnected adapter
    pub fn new(config: FeetechConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, bus: None })
    }

    fn bus(&mut self) -> Result<&mut FeetechBus<Box<dyn SerialPort>>> {
        self.bus
            .as_mut()
            .ok_or_else(|| Error::InvalidState("Feetech arm is not connected".into()))
    }
}

impl HardwareAdapter for FeetechArm {
    fn name(&self) -> &str {
        "feetech"
    }

    fn connect(&mut self) -> Result<()> {
        if self.bus.is_some() {
            return Ok(());
        }
        tracing::info!(
            "Connecting to Feetech arm on {} at {} baud",
            self.config.port,
            self.config.baudrate
        );

        let port = serialport::new(&self.config.port, self.config.baudrate)
            .timeout(self.config.timeout)
            .open()
            .map_err(|e| {
                Error::Hardware(format!("Failed to open port {}: {}", self.config.port, e))
            })?;
        let mut bus = FeetechBus::new(port, self.config.timeout);

        for &id in &self.config.servo_ids {
            if !bus.ping(id)? {
                tracing::warn!("Servo {} did not respond to ping", id);
            }
        }
        bus.set_torque(&self.config.servo_ids, true)?;

        self.bus = Some(bus);
        tracing::info!("Feetech arm connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    fn observation(&mut self) -> Result<RawObservation> {
        let ids = self.config.servo_ids;
        let gripper = self.config.gripper;
        let raw = self.bus()?.sync_read_positions(&ids)?;

        let mut state = [0.0; ACTION_DIM];
        for (slot, &step) in state.iter_mut().zip(raw.iter()) {
            *slot = step_to_radians(step);
        }
        state[GRIPPER] = gripper.to_normalized(state[GRIPPER]);

        Ok(RawObservation {
            state,
            images: None,
        })
    }

    fn send_action(&mut self, target: &Joints) -> Result<()> {
        let ids = self.config.servo_ids;
        let gripper = self.config.gripper;

        let mut steps = ArrayVec::<u16, ACTION_DIM>::new();
        for (i, &value) in target.iter().enumerate() {
            let radians = if i == GRIPPER {
                gripper.to_encoder(value)
            } else {
                value
            };
            steps.push(radians_to_step(radians));
        }
        self.bus()?.sync_write_positions(&ids, &steps)
    }

    fn close(&mut self) -> Result<()> {
        let ids = self.config.servo_ids;
        if let Some(mut bus) = self.bus.take() {
            tracing::info!("Disabling torque and closing {}", self.config.port);
            bus.set_torque(&ids, false)?;
        }
        Ok(())
    }
}

impl Drop for FeetechArm {
    fn drop(&mut self) {
        // Release torque even if close() was never called
        let _ = self.close();
    }
}

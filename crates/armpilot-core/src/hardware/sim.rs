//! In-process simulated arm
//!
//! First-order tracking toward the last commanded target, optional synthetic
//! cameras, and a [`SimProbe`] for inspecting commands and injecting bus
//! failures from tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Frame, HardwareAdapter, Joints, RawObservation, ACTION_DIM};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct SimLog {
    commands: Vec<Joints>,
    reads: u64,
    fail_reads: usize,
    fail_writes: usize,
    connects: u32,
    closes: u32,
}

/// Test-side view into a [`SimArm`] after it has been moved into a [`super::SharedArm`]
#[derive(Debug, Clone)]
pub struct SimProbe {
    log: Arc<Mutex<SimLog>>,
}

impl SimProbe {
    /// Every target the arm accepted, in order
    pub fn commands(&self) -> Vec<Joints> {
        self.log.lock().commands.clone()
    }

    /// Number of accepted commands
    pub fn command_count(&self) -> usize {
        self.log.lock().commands.len()
    }

    /// Number of successful observation reads
    pub fn read_count(&self) -> u64 {
        self.log.lock().reads
    }

    /// Make the next `n` observation reads fail with a hardware error
    pub fn fail_next_reads(&self, n: usize) {
        self.log.lock().fail_reads = n;
    }

    /// Make the next `n` writes fail with a hardware error
    pub fn fail_next_writes(&self, n: usize) {
        self.log.lock().fail_writes = n;
    }

    /// Number of `connect` calls
    pub fn connects(&self) -> u32 {
        self.log.lock().connects
    }

    /// Number of `close` calls
    pub fn closes(&self) -> u32 {
        self.log.lock().closes
    }
}

/// A simulated 6-DOF arm with gripper
#[derive(Debug)]
pub struct SimArm {
    positions: Joints,
    /// Fraction of the remaining error closed per command (1.0 = instant)
    tracking: f64,
    connected: bool,
    cameras: Vec<(String, u32, u32)>,
    log: Arc<Mutex<SimLog>>,
}

impl SimArm {
    /// Create a sim arm resting at all-zero
    pub fn new() -> Self {
        Self {
            positions: [0.0; ACTION_DIM],
            tracking: 1.0,
            connected: false,
            cameras: Vec::new(),
            log: Arc::new(Mutex::new(SimLog::default())),
        }
    }

    /// Start from a given physical pose (the "power-on" pose)
    pub fn with_initial_pose(mut self, pose: Joints) -> Self {
        self.positions = pose;
        self
    }

    /// Set the tracking fraction, clamped to (0, 1]
    pub fn with_tracking(mut self, tracking: f64) -> Self {
        self.tracking = tracking.clamp(f64::EPSILON, 1.0);
        self
    }

    /// Add a synthetic camera producing black frames
    pub fn with_camera(mut self, name: impl Into<String>, width: u32, height: u32) -> Self {
        self.cameras.push((name.into(), width, height));
        self
    }

    /// Get a probe sharing this arm's log
    pub fn probe(&self) -> SimProbe {
        SimProbe {
            log: Arc::clone(&self.log),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::InvalidState("sim arm is not connected".into()))
        }
    }
}

impl Default for SimArm {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareAdapter for SimArm {
    fn name(&self) -> &str {
        "sim"
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.log.lock().connects += 1;
        tracing::info!("Sim arm connected with {} camera(s)", self.cameras.len());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn observation(&mut self) -> Result<RawObservation> {
        self.ensure_connected()?;
        let mut log = self.log.lock();
        if log.fail_reads > 0 {
            log.fail_reads -= 1;
            return Err(Error::Hardware("simulated read failure".into()));
        }
        log.reads += 1;

        let images = if self.cameras.is_empty() {
            None
        } else {
            Some(
                self.cameras
                    .iter()
                    .map(|(name, w, h)| (name.clone(), Frame::black(*w, *h)))
                    .collect::<BTreeMap<_, _>>(),
            )
        };

        Ok(RawObservation {
            state: self.positions,
            images,
        })
    }

    fn send_action(&mut self, target: &Joints) -> Result<()> {
        self.ensure_connected()?;
        let mut log = self.log.lock();
        if log.fail_writes > 0 {
            log.fail_writes -= 1;
            return Err(Error::Hardware("simulated write failure".into()));
        }
        log.commands.push(*target);

        let tracking = self.tracking;
        self.positions
            .iter_mut()
            .zip(target.iter())
            .for_each(|(pos, &goal)| *pos += (goal - *pos) * tracking);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.log.lock().closes += 1;
        tracing::info!("Sim arm closed");
        Ok(())
    }
}

//! Hardware adapter trait and the lock-protected shared handle

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Joints;
use crate::Result;

/// A single camera image, row-major with interleaved channels
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Channels per pixel (3 for RGB)
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// An all-black frame, used when a camera fails to deliver
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: 3,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    /// Whether the buffer length matches the declared geometry
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * self.channels as usize
    }
}

/// One reading from the arm, in physical units
#[derive(Debug, Clone, Default)]
pub struct RawObservation {
    /// Joint positions (radians) and gripper opening ([0, 1], 1 = closed)
    pub state: Joints,
    /// Camera frames by channel name, if the adapter has cameras
    pub images: Option<BTreeMap<String, Frame>>,
}

/// Trait for the arm hardware boundary
///
/// Implementations own bus protocol, motor enable state and camera capture.
pub trait HardwareAdapter: Send {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Open the bus, enable motors, start cameras
    fn connect(&mut self) -> Result<()>;

    /// Check if the arm is connected
    #[must_use]
    fn is_connected(&self) -> bool;

    /// Read the current joint state and camera frames
    fn observation(&mut self) -> Result<RawObservation>;

    /// Command joint targets (physical frame, already clamped)
    fn send_action(&mut self, target: &Joints) -> Result<()>;

    /// Release the bus and cameras
    fn close(&mut self) -> Result<()>;
}

/// Cloneable handle serializing all access to one hardware adapter
///
/// Every read and write takes the lock for exactly one adapter call, so a
/// second task (e.g. a background home maneuver) can never interleave bus
/// traffic with the control loop.
#[derive(Clone)]
pub struct SharedArm {
    inner: Arc<Mutex<Box<dyn HardwareAdapter>>>,
}

impl SharedArm {
    /// Wrap an adapter
    pub fn new(adapter: impl HardwareAdapter + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(adapter))),
        }
    }

    /// Backend name
    pub fn name(&self) -> String {
        self.inner.lock().name().to_string()
    }

    /// See [`HardwareAdapter::connect`]
    pub fn connect(&self) -> Result<()> {
        self.inner.lock().connect()
    }

    /// See [`HardwareAdapter::is_connected`]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().is_connected()
    }

    /// See [`HardwareAdapter::observation`]
    pub fn observation(&self) -> Result<RawObservation> {
        self.inner.lock().observation()
    }

    /// See [`HardwareAdapter::send_action`]
    pub fn send_action(&self, target: &Joints) -> Result<()> {
        self.inner.lock().send_action(target)
    }

    /// See [`HardwareAdapter::close`]
    pub fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }
}

impl std::fmt::Debug for SharedArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArm").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimArm;

    #[test]
    fn test_black_frame() {
        let frame = Frame::black(4, 2);
        assert_eq!(frame.data.len(), 24);
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_shared_arm_clones_share_adapter() {
        let arm = SharedArm::new(SimArm::new());
        let other = arm.clone();
        arm.connect().unwrap();
        assert!(other.is_connected());

        other.send_action(&[0.1, 0.2, 0.3, 0.0, 0.0, 0.0, 0.5]).unwrap();
        let obs = arm.observation().unwrap();
        assert_eq!(obs.state[2], 0.3);
        assert_eq!(obs.state[6], 0.5);
    }

    #[test]
    fn test_shared_arm_concurrent_writers() {
        let arm = SharedArm::new(SimArm::new());
        arm.connect().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let arm = arm.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        arm.send_action(&[i as f64 * 0.1; 7]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(arm.observation().is_ok());
    }
}

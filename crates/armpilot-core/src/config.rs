//! Process configuration
//!
//! Every section has a working default, so an empty JSON object is a valid
//! config file. Command-line flags override individual fields after loading.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::{ControlLoopConfig, EpisodeSettings, HomeManeuver, ShutdownHome};
use crate::frame::{CalibrationFrame, GripperRange, JointLimits, ZeroConvention};
use crate::hardware::{Joints, ACTION_DIM};
use crate::policy::WebsocketPolicyConfig;
use crate::{Error, Result};

/// Policy server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Bound on one inference round trip
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn websocket(&self) -> WebsocketPolicyConfig {
        WebsocketPolicyConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Episode loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeConfig {
    pub prompt: String,
    /// Steps a cached chunk is reused for (≥ 1)
    pub action_horizon: usize,
    pub control_hz: f64,
    pub interpolation_steps: usize,
    pub max_steps: Option<u64>,
    pub num_episodes: u32,
    /// Consecutive failed episodes before giving up
    pub max_consecutive_failures: u32,
    pub retry_backoff_ms: u64,
    pub deviation_warn_rad: f64,
    pub deviation_log_every: u64,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        let settings = EpisodeSettings::default();
        Self {
            prompt: settings.prompt.to_string(),
            action_horizon: 20,
            control_hz: 10.0,
            interpolation_steps: settings.interpolation_steps,
            max_steps: settings.max_steps,
            num_episodes: 1000,
            max_consecutive_failures: 5,
            retry_backoff_ms: 1_000,
            deviation_warn_rad: settings.deviation_warn_rad,
            deviation_log_every: settings.deviation_log_every,
        }
    }
}

impl EpisodeConfig {
    pub fn settings(&self) -> EpisodeSettings {
        EpisodeSettings {
            prompt: self.prompt.as_str().into(),
            interpolation_steps: self.interpolation_steps,
            max_steps: self.max_steps,
            deviation_warn_rad: self.deviation_warn_rad,
            deviation_log_every: self.deviation_log_every,
        }
    }

    pub fn loop_config(&self) -> ControlLoopConfig {
        ControlLoopConfig::new(self.control_hz).with_name("episode")
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Which hardware adapter to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process simulated arm
    #[default]
    Sim,
    /// Feetech serial-bus arm
    Feetech,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sim" => Ok(Backend::Sim),
            "feetech" => Ok(Backend::Feetech),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sim => write!(f, "sim"),
            Self::Feetech => write!(f, "feetech"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub backend: Backend,
    /// Serial port identifier (ignored by the sim backend)
    pub port: String,
    pub baudrate: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sim,
            port: "/dev/ttyACM0".into(),
            baudrate: 1_000_000,
        }
    }
}

/// Versioned calibration constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub version: String,
    pub signs: Joints,
    pub scale: Joints,
    pub convention: ZeroConvention,
    pub gripper: GripperRange,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            version: "so101-relative-v1".into(),
            signs: [1.0; ACTION_DIM],
            scale: [1.0; ACTION_DIM],
            convention: ZeroConvention::RelativePowerOn,
            gripper: GripperRange::default(),
        }
    }
}

impl CalibrationConfig {
    /// Uncaptured calibration frame
    pub fn frame(&self) -> Result<CalibrationFrame> {
        CalibrationFrame::new(
            self.version.as_str(),
            self.signs,
            self.scale,
            self.convention,
        )
    }
}

/// Home maneuver timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    pub pause_iterations: u32,
    pub pause_rate_hz: f64,
    pub shutdown_steps: u32,
    pub shutdown_rate_hz: f64,
    /// Pose reads tried before shutdown falls back to commanding zero directly
    pub shutdown_read_attempts: u32,
}

impl Default for HomeConfig {
    fn default() -> Self {
        let pause = HomeManeuver::default();
        let shutdown = ShutdownHome::default();
        Self {
            pause_iterations: pause.iterations,
            pause_rate_hz: pause.rate_hz,
            shutdown_steps: shutdown.steps,
            shutdown_rate_hz: shutdown.rate_hz,
            shutdown_read_attempts: shutdown.read_attempts,
        }
    }
}

impl HomeConfig {
    pub fn maneuver(&self) -> HomeManeuver {
        HomeManeuver {
            iterations: self.pause_iterations,
            rate_hz: self.pause_rate_hz,
        }
    }

    pub fn shutdown(&self) -> ShutdownHome {
        ShutdownHome {
            steps: self.shutdown_steps,
            rate_hz: self.shutdown_rate_hz,
            read_attempts: self.shutdown_read_attempts,
        }
    }
}

/// Complete process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub server: ServerConfig,
    pub episode: EpisodeConfig,
    pub hardware: HardwareConfig,
    pub calibration: CalibrationConfig,
    pub limits: JointLimits,
    pub home: HomeConfig,
}

impl PilotConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check every parameter range
    pub fn validate(&self) -> Result<()> {
        let e = &self.episode;
        if e.action_horizon == 0 {
            return Err(Error::Config("action_horizon must be at least 1".into()));
        }
        e.loop_config().validate()?;
        if e.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        if !e.deviation_warn_rad.is_finite() || e.deviation_warn_rad <= 0.0 {
            return Err(Error::Config(format!(
                "deviation_warn_rad must be positive, got {}",
                e.deviation_warn_rad
            )));
        }
        for (name, rate) in [
            ("pause_rate_hz", self.home.pause_rate_hz),
            ("shutdown_rate_hz", self.home.shutdown_rate_hz),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::Config(format!("{} must be positive, got {}", name, rate)));
            }
        }
        if self.hardware.backend == Backend::Feetech {
            if self.hardware.port.is_empty() {
                return Err(Error::Config("feetech backend needs a serial port".into()));
            }
            #[cfg(feature = "hardware-feetech")]
            crate::hardware::FeetechConfig::new(self.hardware.port.as_str())
                .with_gripper(self.calibration.gripper)
                .validate()?;
        }
        let g = self.calibration.gripper;
        if !g.open.is_finite() || !g.closed.is_finite() || g.open == g.closed {
            return Err(Error::Config(format!(
                "gripper open/closed positions must differ, got {} / {}",
                g.open, g.closed
            )));
        }
        self.calibration.frame()?;
        self.limits.validate()
    }
}

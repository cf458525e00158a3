//! armpilot: drive a robot arm from a remote action-chunking policy server
//!
//! Controls while running:
//! - `space`: pause and home; press again to start a fresh episode
//! - `q` / `Esc`: home, release the arm and exit

mod input;

use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use armpilot_core::config::Backend;
use armpilot_core::control::{ChannelObserver, InputSource, NoInput, ObservedTick};
use armpilot_core::hardware::{FeetechArm, FeetechConfig, SharedArm, SimArm};
use armpilot_core::policy::WebsocketPolicyClient;
use armpilot_core::{PilotConfig, Runtime};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::info;
use tracing_subscriber::EnvFilter;

use input::{RawModeWriter, TerminalInput};

/// Drive a 6-DOF arm from a remote action-chunking policy
#[derive(Parser, Debug)]
#[command(name = "armpilot")]
#[command(version)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Policy server host
    #[arg(long)]
    host: Option<String>,

    /// Policy server port
    #[arg(long)]
    port: Option<u16>,

    /// Task prompt sent with every observation
    #[arg(long)]
    prompt: Option<String>,

    /// Steps to reuse one inferred chunk before re-inferring
    #[arg(long)]
    action_horizon: Option<usize>,

    /// Control rate in Hz
    #[arg(long)]
    control_hz: Option<f64>,

    /// Sub-steps used to bridge into a new chunk (0 disables)
    #[arg(long)]
    interpolation_steps: Option<usize>,

    /// Control ticks per episode
    #[arg(long)]
    max_steps: Option<u64>,

    /// Episodes to run
    #[arg(long)]
    num_episodes: Option<u32>,

    /// Hardware backend: sim or feetech
    #[arg(long)]
    backend: Option<Backend>,

    /// Serial port of the arm
    #[arg(long)]
    robot_port: Option<String>,

    /// No terminal input (no pause/quit keys)
    #[arg(long)]
    headless: bool,

    /// Log a line per second of observations from a background monitor
    #[arg(long)]
    monitor: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn resolve(&self) -> Result<PilotConfig> {
        let mut config = match &self.config {
            Some(path) => PilotConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => PilotConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply(&self, config: &mut PilotConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(prompt) = &self.prompt {
            config.episode.prompt = prompt.clone();
        }
        if let Some(h) = self.action_horizon {
            config.episode.action_horizon = h;
        }
        if let Some(hz) = self.control_hz {
            config.episode.control_hz = hz;
        }
        if let Some(n) = self.interpolation_steps {
            config.episode.interpolation_steps = n;
        }
        if self.max_steps.is_some() {
            config.episode.max_steps = self.max_steps;
        }
        if let Some(n) = self.num_episodes {
            config.episode.num_episodes = n;
        }
        if let Some(backend) = self.backend {
            config.hardware.backend = backend;
        }
        if let Some(port) = &self.robot_port {
            config.hardware.port = port.clone();
        }
    }
}

fn init_tracing(raw_terminal: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if raw_terminal {
        builder
            .with_writer(|| RawModeWriter::new(io::stderr()))
            .init();
    } else {
        builder.with_writer(io::stderr).init();
    }
}

fn build_arm(config: &PilotConfig) -> Result<SharedArm> {
    Ok(match config.hardware.backend {
        Backend::Sim => SharedArm::new(
            SimArm::new()
                .with_tracking(0.5)
                .with_camera("base_0_rgb", 224, 224)
                .with_camera("left_wrist_0_rgb", 224, 224),
        ),
        Backend::Feetech => SharedArm::new(FeetechArm::new(
            FeetechConfig::new(config.hardware.port.as_str())
                .with_baudrate(config.hardware.baudrate)
                .with_gripper(config.calibration.gripper),
        )?),
    })
}

fn spawn_monitor(rx: Receiver<ObservedTick>, every: u64) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("monitor".into())
        .spawn(move || {
            for ObservedTick { tick, observation } in rx {
                if tick % every != 0 {
                    continue;
                }
                let cameras = observation.images.as_ref().map_or(0, |m| m.len());
                let state: Vec<String> =
                    observation.state.iter().map(|v| format!("{:+.3}", v)).collect();
                info!(target: "monitor", "tick {}: [{}] cameras={}", tick, state.join(" "), cameras);
            }
        })?;
    Ok(handle)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(!args.headless && !args.print_config);
    let config = args.resolve()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(
        "armpilot {} | server {}:{} | {} backend | horizon {} @ {} Hz",
        armpilot_core::VERSION,
        config.server.host,
        config.server.port,
        config.hardware.backend,
        config.episode.action_horizon,
        config.episode.control_hz
    );

    let policy = WebsocketPolicyClient::new(config.server.websocket());
    let arm = build_arm(&config)?;
    let input: Box<dyn InputSource> = if args.headless {
        Box::new(NoInput)
    } else {
        info!("Controls: [space] pause/home, again for a new episode | [q] quit");
        Box::new(TerminalInput::spawn().context("enabling terminal raw mode")?)
    };

    let monitor_every = config.episode.control_hz.round().max(1.0) as u64;
    let mut runtime = Runtime::new(config, policy, arm, input)?;
    let mut monitor = None;
    if args.monitor {
        let (observer, rx) = ChannelObserver::bounded(8);
        runtime = runtime.with_observer(Box::new(observer));
        monitor = Some(spawn_monitor(rx, monitor_every)?);
    }

    let result = runtime.run();
    // dropping the runtime closes the observer channel
    drop(runtime);
    if let Some(handle) = monitor {
        let _ = handle.join();
    }

    let summary = result?;
    info!(
        "Done: {} episodes ({} completed, {} reset, {} failed){}",
        summary.episodes,
        summary.completed,
        summary.resets,
        summary.failures,
        if summary.quit { ", quit by operator" } else { "" }
    );
    Ok(())
}

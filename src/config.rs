//! Configuration management for the GDB server

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::controller::ControllerConfig;
use crate::error::{DebugError, Result};
use crate::gdb::GdbServerConfig;
use crate::probe::{ProbeBackend, ProbeRsConfig, SimulatorConfig};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "probe-gdb-server")]
#[command(about = "GDB Remote Serial Protocol server for on-chip debugging")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PROBE_GDB_SERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Address the GDB server listens on
    #[arg(long)]
    pub listen_address: Option<String>,

    /// GDB server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Debug backend
    #[arg(long, value_enum)]
    pub backend: Option<ProbeBackend>,

    /// Probe selector: "auto", a serial number or part of the probe identifier
    #[arg(long)]
    pub probe: Option<String>,

    /// Target chip name as known to probe-rs (e.g. STM32F407VGTx)
    #[arg(long)]
    pub chip: Option<String>,

    /// Probe speed in kHz
    #[arg(long)]
    pub speed: Option<u32>,

    /// Per command timeout in milliseconds
    #[arg(long)]
    pub command_timeout: Option<u64>,

    /// List connected debug probes and exit
    #[arg(long)]
    pub list_probes: bool,

    /// Generate default configuration file
    #[arg(long)]
    pub generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Show current configuration and exit
    #[arg(long)]
    pub show_config: bool,
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub debugger: DebuggerConfig,
    pub controller: ControllerSection,
    pub gdb: GdbSection,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path).map_err(|e| {
                DebugError::InvalidConfig(format!("Failed to read config file: {}", e))
            })?;
            Self::from_toml(&content)
        } else {
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| DebugError::InvalidConfig(format!("Invalid TOML syntax: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge command line arguments into configuration
    pub fn merge_args(&mut self, args: &Args) {
        if let Some(address) = &args.listen_address {
            self.server.listen_address = address.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(backend) = args.backend {
            self.debugger.backend = backend;
        }
        if let Some(probe) = &args.probe {
            self.debugger.probe_selector = probe.clone();
        }
        if let Some(chip) = &args.chip {
            self.debugger.target_chip = chip.clone();
        }
        if let Some(speed) = args.speed {
            self.debugger.speed_khz = speed;
        }
        if let Some(timeout) = args.command_timeout {
            self.controller.command_timeout_ms = timeout;
        }
        self.logging.level = args.log_level.clone();
        if args.log_file.is_some() {
            self.logging.file = args.log_file.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.debugger.speed_khz == 0 {
            return Err(DebugError::InvalidConfig("debugger.speed_khz must be > 0".to_string()));
        }
        if self.controller.command_timeout_ms == 0 {
            return Err(DebugError::InvalidConfig(
                "controller.command_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.controller.poll_interval_ms == 0 {
            return Err(DebugError::InvalidConfig(
                "controller.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.controller.queue_depth == 0 {
            return Err(DebugError::InvalidConfig("controller.queue_depth must be > 0".to_string()));
        }
        if self.gdb.packet_size < 64 {
            return Err(DebugError::InvalidConfig("gdb.packet_size must be >= 64".to_string()));
        }
        if self.simulator.memory_size < 2 {
            return Err(DebugError::InvalidConfig(
                "simulator.memory_size must be >= 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DebugError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            command_timeout: Duration::from_millis(self.controller.command_timeout_ms),
            poll_interval: Duration::from_millis(self.controller.poll_interval_ms),
            queue_depth: self.controller.queue_depth,
        }
    }

    pub fn gdb_server_config(&self) -> GdbServerConfig {
        GdbServerConfig {
            listen_address: self.server.listen_address.clone(),
            port: self.server.port,
            packet_size: self.gdb.packet_size,
            halt_on_connect: self.gdb.halt_on_connect,
            resume_on_disconnect: self.gdb.resume_on_disconnect,
        }
    }

    pub fn probe_rs_config(&self) -> ProbeRsConfig {
        ProbeRsConfig {
            probe_selector: self.debugger.probe_selector.clone(),
            target_chip: self.debugger.target_chip.clone(),
            speed_khz: self.debugger.speed_khz,
            connect_under_reset: self.debugger.connect_under_reset,
            core_index: self.debugger.core_index,
            halt_timeout_ms: self.debugger.halt_timeout_ms,
        }
    }

    pub fn simulator_config(&self) -> SimulatorConfig {
        self.simulator.clone()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.server.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Bounded wait for the target controller to become active
    pub startup_timeout_ms: u64,
    /// Bounded wait for the target controller to stop
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 1442,
            startup_timeout_ms: 10000,
            shutdown_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DebuggerConfig {
    pub backend: ProbeBackend,
    pub probe_selector: String,
    pub target_chip: String,
    pub speed_khz: u32,
    pub connect_under_reset: bool,
    pub core_index: usize,
    pub halt_timeout_ms: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        let probe = ProbeRsConfig::default();
        Self {
            backend: ProbeBackend::ProbeRs,
            probe_selector: probe.probe_selector,
            target_chip: probe.target_chip,
            speed_khz: probe.speed_khz,
            connect_under_reset: probe.connect_under_reset,
            core_index: probe.core_index,
            halt_timeout_ms: probe.halt_timeout_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ControllerSection {
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub queue_depth: usize,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5000,
            poll_interval_ms: 10,
            queue_depth: 32,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GdbSection {
    pub packet_size: usize,
    pub halt_on_connect: bool,
    pub resume_on_disconnect: bool,
}

impl Default for GdbSection {
    fn default() -> Self {
        Self {
            packet_size: 4096,
            halt_on_connect: true,
            resume_on_disconnect: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

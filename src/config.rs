use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub scan: ScanConfig,
    pub router: RouterConfig,
    pub dnp3: Dnp3Config,
    pub modbus: ModbusConfig,
    pub api: ApiConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `gauss_seidel` or the name of a registered adapter
    pub kind: String,
    pub topology_path: PathBuf,
    pub max_iterations: u32,
    pub tolerance: f64,
    pub acceleration: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: "gauss_seidel".to_string(),
            topology_path: PathBuf::from("config/topology.toml"),
            max_iterations: 100,
            tolerance: 1e-6,
            acceleration: 1.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub period_ms: u64,
    pub solve_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            solve_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Dnp3Config {
    pub enabled: bool,
    pub bind: String,
    /// Outstation link address
    pub local_address: u16,
    /// Master link address accepted as source
    pub remote_address: u16,
    pub unsolicited: bool,
    /// Engineering-unit change that raises an analog event
    pub analog_deadband: f64,
    pub event_buffer_size: usize,
    pub select_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
}

impl Default for Dnp3Config {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:20000".to_string(),
            local_address: 10,
            remote_address: 1,
            unsolicited: false,
            analog_deadband: 0.01,
            event_buffer_size: 256,
            select_timeout_ms: 5000,
            confirm_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:502".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Config {
    /// Defaults, then `config/default.toml`, then `GRIDGW__` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GRIDGW__").split("__"));
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.engine.max_iterations == 0 {
            return Err("engine.max_iterations must be at least 1".to_string());
        }
        if !(self.engine.tolerance > 0.0) {
            return Err("engine.tolerance must be positive".to_string());
        }
        if !(self.engine.acceleration > 0.0 && self.engine.acceleration < 2.0) {
            return Err("engine.acceleration must be in (0, 2)".to_string());
        }
        if self.scan.period_ms == 0 {
            return Err("scan.period_ms must be positive".to_string());
        }
        if self.scan.solve_timeout_ms == 0 {
            return Err("scan.solve_timeout_ms must be positive".to_string());
        }
        if self.router.queue_capacity == 0 {
            return Err("router.queue_capacity must be positive".to_string());
        }
        if self.dnp3.local_address == self.dnp3.remote_address {
            return Err("dnp3.local_address and dnp3.remote_address must differ".to_string());
        }
        if self.dnp3.local_address >= 0xFFF0 {
            return Err("dnp3.local_address is in the reserved range".to_string());
        }
        if self.dnp3.event_buffer_size == 0 {
            return Err("dnp3.event_buffer_size must be positive".to_string());
        }
        if self.dnp3.analog_deadband < 0.0 {
            return Err("dnp3.analog_deadband must not be negative".to_string());
        }
        if self.events.capacity == 0 {
            return Err("events.capacity must be positive".to_string());
        }
        for (name, enabled, bind) in [
            ("dnp3", self.dnp3.enabled, &self.dnp3.bind),
            ("modbus", self.modbus.enabled, &self.modbus.bind),
            ("api", self.api.enabled, &self.api.bind),
        ] {
            if enabled && bind.parse::<SocketAddr>().is_err() {
                return Err(format!("{name}.bind '{bind}' is not a socket address"));
            }
        }
        Ok(())
    }
}

use crate::engine::EngineSettings;
use crate::injection::{InjectedProtocolStructure, InjectionError, InjectionMethod, InjectionMode};
use crate::monitor::SessionSetup;
use crate::random::RandomSource;
use crate::record::RecordPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("[{0}] host must not be empty")]
    EmptyHost(&'static str),
    #[error("[{0}] port must not be 0")]
    ZeroPort(&'static str),
    #[error("Cannot resolve {address}: {source}")]
    Unresolvable {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} resolved to no usable address")]
    NoAddress(String),
    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),
    #[error("Target kind is monitor but no [monitor] section is configured")]
    MissingMonitorSection,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub record_policy: RecordPolicy,
    pub seed: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub max_iterations: Option<u64>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_interval_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    1000
}

pub fn default_workers() -> usize {
    4
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./wirefuzz_records")
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            record_policy: RecordPolicy::default(),
            seed: None,
            workers: default_workers(),
            max_iterations: None,
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Plain TCP connection to the target.
    #[default]
    Direct,
    /// Messages go through a monitor session.
    Monitor,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub kind: TargetKind,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            kind: TargetKind::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    pub connector: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub watchers: Vec<String>,
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_protocol_version() -> String {
    "1.0".to_string()
}

/// Per-variable-block override. `index` counts variable blocks only.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BlockOverride {
    pub index: usize,
    #[serde(default)]
    pub method: InjectionMethod,
    pub library: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InjectionSettings {
    #[serde(default)]
    pub mode: InjectionMode,
    #[serde(default)]
    pub blocks: Vec<BlockOverride>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WirefuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub target: TargetSettings,
    pub monitor: Option<MonitorSettings>,
    #[serde(default)]
    pub injection: InjectionSettings,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let address = format!("{host}:{port}");
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|source| ConfigError::Unresolvable {
            address: address.clone(),
            source,
        })?;
    addrs.next().ok_or(ConfigError::NoAddress(address))
}

fn check_endpoint(section: &'static str, host: &str, port: u16) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::EmptyHost(section));
    }
    if port == 0 {
        return Err(ConfigError::ZeroPort(section));
    }
    Ok(())
}

impl WirefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: WirefuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Rejects settings that cannot produce a working run, including
    /// addresses that do not resolve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fuzzer.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("fuzzer.timeout-ms"));
        }
        match self.target.kind {
            TargetKind::Direct => {
                self.target_addr()?;
            }
            // The monitor owns the connection to the target.
            TargetKind::Monitor => {
                let monitor = self
                    .monitor
                    .as_ref()
                    .ok_or(ConfigError::MissingMonitorSection)?;
                if monitor.response_timeout_ms == 0 {
                    return Err(ConfigError::ZeroTimeout("monitor.response-timeout-ms"));
                }
                self.monitor_addr()?;
            }
        }
        Ok(())
    }

    pub fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        check_endpoint("target", &self.target.host, self.target.port)?;
        resolve(&self.target.host, self.target.port)
    }

    pub fn monitor_addr(&self) -> Result<SocketAddr, ConfigError> {
        let monitor = self
            .monitor
            .as_ref()
            .ok_or(ConfigError::MissingMonitorSection)?;
        check_endpoint("monitor", &monitor.host, monitor.port)?;
        resolve(&monitor.host, monitor.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.fuzzer.timeout_ms)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            interval: Duration::from_millis(self.fuzzer.interval_ms),
            policy: self.fuzzer.record_policy,
            max_iterations: self.fuzzer.max_iterations,
        }
    }

    pub fn session_setup(&self) -> Option<SessionSetup> {
        self.monitor.as_ref().map(|m| SessionSetup {
            version: m.protocol_version.clone(),
            connector: m.connector.clone(),
            parameters: m
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            watchers: m.watchers.clone(),
        })
    }

    pub fn random_source(&self) -> RandomSource {
        match self.fuzzer.seed {
            Some(seed) => RandomSource::from_seed(seed),
            None => RandomSource::from_clock(),
        }
    }

    /// Applies the `[injection]` section: mode first, then each block
    /// override in file order. Relative library paths resolve against
    /// `base_dir`.
    pub fn apply_injection(
        &self,
        structure: &mut InjectedProtocolStructure,
        base_dir: &Path,
    ) -> Result<(), InjectionError> {
        structure.set_injection_mode(self.injection.mode);
        for block in &self.injection.blocks {
            structure.set_injection_method(block.method, block.index)?;
            if let Some(library) = &block.library {
                structure.set_library(&base_dir.join(library), block.index)?;
            }
        }
        Ok(())
    }
}

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use inverter_controller::ControllerConfig;
use modbus_client::{ClientConfig, DEFAULT_BAUD_RATE};
use register_map::{adapter, find_model, AdapterKind, ConnectionTypeKey, InverterAdapter};
use types::{ConnectionKey, TransportKind};

const DEFAULT_SLAVE_ID: u8 = 247;
const DEFAULT_ADAPTER: &str = "direct";
const DEFAULT_SETUP_RETRY_MS: u64 = 30_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub modbus: ClientConfig,
    pub metrics_listen: Option<String>,
    /// Delay before retrying an inverter whose setup failed.
    pub setup_retry_ms: u64,
    pub inverters: Vec<InverterConfig>,
}

/// One inverter as written in the config file, before adapter defaults are
/// applied.
#[derive(Clone, Debug, PartialEq)]
pub struct InverterConfig {
    pub name: String,
    pub adapter: String,
    pub protocol: Option<TransportKind>,
    pub host: String,
    pub baud_rate: Option<u32>,
    pub slave: u8,
    pub poll_interval_ms: Option<u64>,
    pub max_read: Option<u16>,
    pub model: Option<String>,
}

/// Fully resolved connection parameters for one inverter.
#[derive(Clone, Debug, PartialEq)]
pub struct InverterConnectionConfig {
    pub name: String,
    pub adapter_id: &'static str,
    pub transport: TransportKind,
    pub host: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    pub poll_interval: Duration,
    pub max_read: u16,
    pub connection_type: ConnectionTypeKey,
    pub model: Option<String>,
}

impl InverterConnectionConfig {
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            transport: self.transport,
            endpoint: self.host.clone(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            name: self.name.clone(),
            slave_id: self.slave_id,
            poll_interval: self.poll_interval,
            max_read: self.max_read,
            connection_type: self.connection_type,
            model: self.model.clone(),
        }
    }
}

impl InverterConfig {
    /// Merges the adapter's defaults under the per-inverter options.
    pub fn resolve(&self) -> Result<InverterConnectionConfig> {
        let adapter = adapter(&self.adapter)
            .ok_or_else(|| anyhow::anyhow!("inverter {}: unknown adapter {}", self.name, self.adapter))?;
        let transport = match self.protocol {
            Some(protocol) => protocol,
            None => default_protocol(adapter),
        };

        Ok(InverterConnectionConfig {
            name: self.name.clone(),
            adapter_id: adapter.adapter_id,
            transport,
            host: self.host.clone(),
            baud_rate: self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            slave_id: self.slave,
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(adapter.poll_interval),
            max_read: self.max_read.unwrap_or(adapter.max_read),
            connection_type: adapter.connection_type,
            model: self.model.clone(),
        })
    }
}

fn default_protocol(adapter: &InverterAdapter) -> TransportKind {
    match adapter.kind {
        AdapterKind::Serial => TransportKind::Serial,
        AdapterKind::Direct | AdapterKind::Network => adapter
            .recommended_protocol
            .or_else(|| adapter.network_protocols.first().copied())
            .unwrap_or(TransportKind::Tcp),
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Resolved connection parameters for every configured inverter.
    pub fn connections(&self) -> Result<Vec<InverterConnectionConfig>> {
        self.inverters.iter().map(InverterConfig::resolve).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.modbus.timeout_ms == 0 {
            anyhow::bail!("modbus.timeout_ms must be >= 1");
        }
        if self.modbus.retry_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_backoff_ms must be >= 1");
        }
        if self.setup_retry_ms == 0 {
            anyhow::bail!("setup_retry_ms must be >= 1");
        }
        if let Some(ref listen) = self.metrics_listen {
            listen
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("metrics.listen {listen} is not a socket address"))?;
        }
        if self.inverters.is_empty() {
            anyhow::bail!("at least one inverter must be configured");
        }

        let mut names = HashSet::new();
        let mut endpoints = HashSet::new();
        for inverter in &self.inverters {
            validate_name(&inverter.name)?;
            if !names.insert(inverter.name.as_str()) {
                anyhow::bail!("inverter name {} is used more than once", inverter.name);
            }

            let resolved = inverter.resolve()?;
            let adapter = adapter(resolved.adapter_id)
                .ok_or_else(|| anyhow::anyhow!("unknown adapter {}", resolved.adapter_id))?;
            if !adapter.supports(resolved.transport) {
                anyhow::bail!(
                    "inverter {}: adapter {} does not support protocol {}",
                    inverter.name,
                    adapter.adapter_id,
                    resolved.transport
                );
            }
            validate_host(&inverter.name, resolved.transport, &resolved.host)?;
            if resolved.poll_interval.is_zero() {
                anyhow::bail!("inverter {}: poll_interval_ms must be >= 1", inverter.name);
            }
            if resolved.max_read == 0 {
                anyhow::bail!("inverter {}: max_read must be >= 1", inverter.name);
            }
            if let Some(ref model) = resolved.model {
                find_model(model).with_context(|| format!("inverter {}", inverter.name))?;
            }
            if resolved.baud_rate == 0 {
                anyhow::bail!("inverter {}: baud_rate must be >= 1", inverter.name);
            }
            if !endpoints.insert((resolved.transport, resolved.host.clone(), resolved.slave_id)) {
                anyhow::bail!(
                    "inverter {}: {}://{} slave {} is already configured",
                    inverter.name,
                    resolved.transport,
                    resolved.host,
                    resolved.slave_id
                );
            }
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            modbus: ClientConfig::default(),
            metrics_listen: None,
            setup_retry_ms: DEFAULT_SETUP_RETRY_MS,
            inverters: Vec::new(),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|ch| ch.is_alphanumeric() || ch == '_') {
        anyhow::bail!("inverter name {name:?} may only contain letters, digits and underscores");
    }
    Ok(())
}

fn validate_host(name: &str, transport: TransportKind, host: &str) -> Result<()> {
    match transport {
        TransportKind::Tcp | TransportKind::Udp => {
            let valid = host
                .rsplit_once(':')
                .map(|(address, port)| !address.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0))
                .unwrap_or(false);
            if !valid {
                anyhow::bail!("inverter {name}: host must be host:port, got {host:?}");
            }
        }
        TransportKind::Serial => {
            if host.trim().is_empty() {
                anyhow::bail!("inverter {name}: serial device path must be non-empty");
            }
        }
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Some(timeout_ms) = parse_env_u64("INVERTER_POLLER_TIMEOUT_MS") {
        config.modbus.timeout_ms = timeout_ms;
    }

    config.metrics_listen = env::var("INVERTER_POLLER_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    modbus: Option<FileModbusConfig>,
    metrics: Option<FileMetricsConfig>,
    setup_retry_ms: Option<u64>,
    inverters: Option<Vec<FileInverterConfig>>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    name: String,
    adapter: Option<String>,
    protocol: Option<TransportKind>,
    host: String,
    baud_rate: Option<u32>,
    slave: Option<u8>,
    poll_interval_ms: Option<u64>,
    max_read: Option<u16>,
    model: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("INVERTER_POLLER_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut AppConfig, file: FileConfig) {
    if let Some(modbus) = file.modbus {
        if let Some(timeout_ms) = modbus.timeout_ms {
            config.modbus.timeout_ms = timeout_ms;
        }
        if let Some(retry_count) = modbus.retry_count {
            config.modbus.retry_count = retry_count;
        }
        if let Some(backoff) = modbus.retry_backoff_ms {
            config.modbus.retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = modbus.retry_max_backoff_ms {
            config.modbus.retry_max_backoff_ms = max_backoff;
        }
    }

    if let Some(listen) = file.metrics.and_then(|metrics| metrics.listen) {
        config.metrics_listen = Some(listen);
    }

    if let Some(retry_ms) = file.setup_retry_ms {
        config.setup_retry_ms = retry_ms;
    }

    if let Some(inverters) = file.inverters {
        config.inverters = inverters
            .into_iter()
            .map(|inverter| InverterConfig {
                name: inverter.name,
                adapter: inverter.adapter.unwrap_or_else(|| DEFAULT_ADAPTER.to_string()),
                protocol: inverter.protocol,
                host: inverter.host,
                baud_rate: inverter.baud_rate,
                slave: inverter.slave.unwrap_or(DEFAULT_SLAVE_ID),
                poll_interval_ms: inverter.poll_interval_ms,
                max_read: inverter.max_read,
                model: inverter.model,
            })
            .collect();
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

//! Static register maps for the supported inverter families.
//!
//! The catalog is compiled in and never mutated. A controller resolves it
//! once per connection with [`entries_for`], after reading the probe
//! registers returned by [`probe_addresses`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use types::RegisterType;

pub mod adapters;
mod catalog;
pub mod charge_period;

pub use adapters::{adapter, adapters, AdapterKind, InverterAdapter};
pub use catalog::{EntryDefinition, InverterModel, MODELS};
pub use charge_period::{charge_period_words, ChargePeriod, CHARGE_PERIOD_ADDRESS};
pub use value_codec::{DataType, RegisterEntry, Validation};

/// Number of identification registers, one ASCII character each.
pub const IDENTITY_REGISTER_COUNT: u16 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionTypeKey {
    /// The inverter's own Ethernet port.
    Lan,
    /// The RS485 port, reached through an adapter.
    Aux,
}

impl std::fmt::Display for ConnectionTypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionTypeKey::Lan => f.write_str("LAN"),
            ConnectionTypeKey::Aux => f.write_str("AUX"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionType {
    pub key: ConnectionTypeKey,
    /// Register table telemetry is read from.
    pub register_type: RegisterType,
    pub identity_address: u16,
    pub identity_register_type: RegisterType,
}

pub static CONNECTION_TYPES: [ConnectionType; 2] = [
    ConnectionType {
        key: ConnectionTypeKey::Lan,
        register_type: RegisterType::Input,
        identity_address: 30_000,
        identity_register_type: RegisterType::Input,
    },
    ConnectionType {
        key: ConnectionTypeKey::Aux,
        register_type: RegisterType::Holding,
        identity_address: 30_000,
        identity_register_type: RegisterType::Input,
    },
];

pub fn connection_type(key: ConnectionTypeKey) -> &'static ConnectionType {
    match key {
        ConnectionTypeKey::Lan => &CONNECTION_TYPES[0],
        ConnectionTypeKey::Aux => &CONNECTION_TYPES[1],
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    #[error("unknown inverter model {0}")]
    UnknownModel(String),
    #[error("model {model} does not support the {connection_type} connection")]
    UnsupportedConnectionType {
        model: &'static str,
        connection_type: ConnectionTypeKey,
    },
    #[error("invalid charge period {index}: {reason}")]
    InvalidChargePeriod { index: usize, reason: &'static str },
    #[error("at most {max} charge periods are supported, got {actual}")]
    TooManyChargePeriods { max: usize, actual: usize },
}

/// Raw words read from the probe registers at setup, keyed by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResults(BTreeMap<u16, u16>);

impl ProbeResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u16, value: u16) {
        self.0.insert(address, value);
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.0.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u16, u16)> for ProbeResults {
    fn from_iter<I: IntoIterator<Item = (u16, u16)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Finds a model by its base name, e.g. `H1`.
pub fn find_model(base_model: &str) -> Result<&'static InverterModel, MapError> {
    MODELS
        .iter()
        .find(|model| model.base_model.eq_ignore_ascii_case(base_model))
        .ok_or_else(|| MapError::UnknownModel(base_model.to_string()))
}

/// Matches a full model string reported by the inverter (e.g. `H1-5.0-E`).
pub fn model_for(full_model: &str) -> Option<&'static InverterModel> {
    MODELS.iter().find(|model| {
        model
            .prefixes
            .iter()
            .any(|prefix| full_model.starts_with(prefix))
    })
}

/// Registers to read once at setup before resolving entries.
pub fn probe_addresses(model: &InverterModel, key: ConnectionTypeKey) -> Vec<(RegisterType, u16)> {
    model
        .probes
        .iter()
        .filter(|(probe_key, _, _)| *probe_key == key)
        .map(|(_, register_type, address)| (*register_type, *address))
        .collect()
}

/// Resolves the catalog into concrete entries for one connection.
pub fn entries_for(
    model: &InverterModel,
    key: ConnectionTypeKey,
    probes: &ProbeResults,
) -> Result<Vec<RegisterEntry>, MapError> {
    if !model.connection_types.contains(&key) {
        return Err(MapError::UnsupportedConnectionType {
            model: model.base_model,
            connection_type: key,
        });
    }

    let profile = connection_type(key);
    let entries = catalog::ENTRY_DEFINITIONS
        .iter()
        .filter(|definition| definition.models.contains(&model.base_model))
        .filter(|definition| definition.predicate.map_or(true, |present| present(probes)))
        .filter_map(|definition| definition.resolve(profile))
        .collect::<Vec<_>>();

    debug!(
        model = model.base_model,
        connection_type = %key,
        probes = probes.len(),
        entries = entries.len(),
        "register map resolved"
    );
    Ok(entries)
}

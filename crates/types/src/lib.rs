use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// A decoded register value after scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// Names of the bits that are set, in ascending bit order.
    Flags(Vec<String>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl Value {
    /// Numeric view used by range validators.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Flags(names) => write!(f, "[{}]", names.join(",")),
            Value::Date(v) => write!(f, "{v}"),
            Value::Time(v) => write!(f, "{}", v.format("%H:%M")),
            Value::DateTime(v) => write!(f, "{v}"),
        }
    }
}

/// Modbus register table an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Serial => "serial",
        };
        f.write_str(name)
    }
}

/// Identity of one physical link. Inverters sharing a key share a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub transport: TransportKind,
    /// `host:port` for network transports, the device path for serial.
    pub endpoint: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.endpoint)
    }
}

/// Decoded values of one completed poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResult {
    pub inverter: String,
    pub collected_at_ms: u64,
    pub values: BTreeMap<String, Value>,
    /// Entries that could not be produced this cycle, with the reason.
    pub unavailable: BTreeMap<String, String>,
}

impl PollResult {
    pub fn new(inverter: impl Into<String>, collected_at_ms: u64) -> Self {
        Self {
            inverter: inverter.into(),
            collected_at_ms,
            values: BTreeMap::new(),
            unavailable: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

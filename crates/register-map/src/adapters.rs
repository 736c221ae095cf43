//! Hardware adapters used to reach an inverter, with their default polling
//! settings. Per-inverter options override these defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use types::TransportKind;

use crate::ConnectionTypeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Inverter's own LAN port.
    Direct,
    /// USB/RS485 serial adapter on the host.
    Serial,
    /// RS485 to Ethernet/WiFi bridge.
    Network,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InverterAdapter {
    pub adapter_id: &'static str,
    pub kind: AdapterKind,
    pub connection_type: ConnectionTypeKey,
    pub network_protocols: &'static [TransportKind],
    pub recommended_protocol: Option<TransportKind>,
    pub poll_interval: Duration,
    pub max_read: u16,
}

impl InverterAdapter {
    pub fn supports(&self, transport: TransportKind) -> bool {
        match self.kind {
            AdapterKind::Serial => transport == TransportKind::Serial,
            AdapterKind::Direct | AdapterKind::Network => self.network_protocols.contains(&transport),
        }
    }
}

static ADAPTERS: [InverterAdapter; 5] = [
    InverterAdapter {
        adapter_id: "direct",
        kind: AdapterKind::Direct,
        connection_type: ConnectionTypeKey::Lan,
        network_protocols: &[TransportKind::Tcp],
        recommended_protocol: None,
        poll_interval: Duration::from_secs(10),
        max_read: 100,
    },
    InverterAdapter {
        adapter_id: "usr_w610",
        kind: AdapterKind::Network,
        connection_type: ConnectionTypeKey::Aux,
        network_protocols: &[TransportKind::Tcp, TransportKind::Udp],
        recommended_protocol: Some(TransportKind::Udp),
        poll_interval: Duration::from_secs(15),
        max_read: 8,
    },
    InverterAdapter {
        adapter_id: "elfin_ew11",
        kind: AdapterKind::Network,
        connection_type: ConnectionTypeKey::Aux,
        network_protocols: &[TransportKind::Tcp],
        recommended_protocol: None,
        poll_interval: Duration::from_secs(10),
        max_read: 50,
    },
    InverterAdapter {
        adapter_id: "waveshare_rs485_eth",
        kind: AdapterKind::Network,
        connection_type: ConnectionTypeKey::Aux,
        network_protocols: &[TransportKind::Tcp],
        recommended_protocol: None,
        poll_interval: Duration::from_secs(10),
        max_read: 50,
    },
    InverterAdapter {
        adapter_id: "serial_other",
        kind: AdapterKind::Serial,
        connection_type: ConnectionTypeKey::Aux,
        network_protocols: &[],
        recommended_protocol: None,
        poll_interval: Duration::from_secs(10),
        max_read: 100,
    },
];

pub fn adapters() -> &'static [InverterAdapter] {
    &ADAPTERS
}

pub fn adapter(adapter_id: &str) -> Option<&'static InverterAdapter> {
    ADAPTERS.iter().find(|adapter| adapter.adapter_id == adapter_id)
}

use std::ops::RangeInclusive;

use types::RegisterType;
use value_codec::DataType::{Bitfield, TimeOfDay, I16, U16, U32};
use value_codec::{BitTable, DataType, RegisterEntry, Validation};

use crate::{ConnectionType, ConnectionTypeKey, ProbeResults};

/// Decides from the setup probe whether an entry exists on this unit.
pub type Predicate = fn(&ProbeResults) -> bool;

/// Catalog row: one named value and where it lives per connection type.
#[derive(Clone, Copy)]
pub struct EntryDefinition {
    pub name: &'static str,
    /// Base models the value exists on.
    pub models: &'static [&'static str],
    pub lan: Option<u16>,
    pub aux: Option<u16>,
    /// Overrides the connection's telemetry table (settings are always holding).
    pub register_type: Option<RegisterType>,
    pub data_type: DataType,
    pub scale: f64,
    pub unit: Option<&'static str>,
    pub validation: Option<Validation>,
    pub predicate: Option<Predicate>,
    pub writable: bool,
}

impl EntryDefinition {
    const fn telemetry(
        name: &'static str,
        models: &'static [&'static str],
        lan: Option<u16>,
        aux: Option<u16>,
        data_type: DataType,
    ) -> Self {
        Self {
            name,
            models,
            lan,
            aux,
            register_type: None,
            data_type,
            scale: 1.0,
            unit: None,
            validation: None,
            predicate: None,
            writable: false,
        }
    }

    /// A writable holding register at the same address on both connections.
    const fn setting(
        name: &'static str,
        models: &'static [&'static str],
        address: u16,
        data_type: DataType,
    ) -> Self {
        Self {
            name,
            models,
            lan: Some(address),
            aux: Some(address),
            register_type: Some(RegisterType::Holding),
            data_type,
            scale: 1.0,
            unit: None,
            validation: None,
            predicate: None,
            writable: true,
        }
    }

    const fn scale(mut self, scale: f64, unit: &'static str) -> Self {
        self.scale = scale;
        self.unit = Some(unit);
        self
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    const fn validate(mut self, validation: Validation) -> Self {
        self.validation = Some(validation);
        self
    }

    const fn when(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub(crate) fn resolve(&self, connection: &ConnectionType) -> Option<RegisterEntry> {
        let address = match connection.key {
            ConnectionTypeKey::Lan => self.lan,
            ConnectionTypeKey::Aux => self.aux,
        }?;
        Some(RegisterEntry {
            name: self.name,
            address,
            register_type: self.register_type.unwrap_or(connection.register_type),
            data_type: self.data_type,
            scale: self.scale,
            unit: self.unit,
            validation: self.validation,
            writable: self.writable,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InverterModel {
    pub base_model: &'static str,
    /// Prefixes of the model string the inverter reports.
    pub prefixes: &'static [&'static str],
    pub connection_types: &'static [ConnectionTypeKey],
    /// Largest gap read across when batching.
    pub max_gap: u16,
    /// Regions the inverter refuses to serve; reads must not span them.
    pub no_read_across: &'static [(ConnectionTypeKey, u16, u16)],
    pub probes: &'static [(ConnectionTypeKey, RegisterType, u16)],
}

impl InverterModel {
    pub fn no_read_across(&self, key: ConnectionTypeKey) -> Vec<RangeInclusive<u16>> {
        self.no_read_across
            .iter()
            .filter(|(region_key, _, _)| *region_key == key)
            .map(|(_, start, end)| *start..=*end)
            .collect()
    }
}

const BOTH: &[ConnectionTypeKey] = &[ConnectionTypeKey::Lan, ConnectionTypeKey::Aux];

/// Manager firmware version, read once at setup.
pub(crate) const MANAGER_VERSION_ADDRESS: u16 = 30_018;
/// Number of battery management units reported by the inverter.
pub(crate) const BMS_COUNT_ADDRESS: u16 = 30_019;

const STANDARD_PROBES: &[(ConnectionTypeKey, RegisterType, u16)] = &[
    (ConnectionTypeKey::Lan, RegisterType::Input, MANAGER_VERSION_ADDRESS),
    (ConnectionTypeKey::Lan, RegisterType::Input, BMS_COUNT_ADDRESS),
    (ConnectionTypeKey::Aux, RegisterType::Input, MANAGER_VERSION_ADDRESS),
    (ConnectionTypeKey::Aux, RegisterType::Input, BMS_COUNT_ADDRESS),
];

pub static MODELS: [InverterModel; 3] = [
    InverterModel {
        base_model: "H1",
        prefixes: &["H1", "AC1", "AIO-H1"],
        connection_types: BOTH,
        max_gap: 10,
        no_read_across: &[],
        probes: STANDARD_PROBES,
    },
    InverterModel {
        base_model: "KH",
        prefixes: &["KH"],
        connection_types: BOTH,
        max_gap: 10,
        no_read_across: &[],
        probes: STANDARD_PROBES,
    },
    InverterModel {
        base_model: "H3",
        prefixes: &["H3", "AC3", "AIO-H3"],
        connection_types: BOTH,
        max_gap: 10,
        no_read_across: &[(ConnectionTypeKey::Aux, 11_085, 11_089)],
        probes: STANDARD_PROBES,
    },
];

fn clock_supported(probes: &ProbeResults) -> bool {
    probes
        .get(MANAGER_VERSION_ADDRESS)
        .map_or(false, |version| version >= 150)
}

fn second_bms_present(probes: &ProbeResults) -> bool {
    matches!(probes.get(BMS_COUNT_ADDRESS), Some(2))
}

const SINGLE_PHASE: &[&str] = &["H1", "KH"];
const THREE_PHASE: &[&str] = &["H3"];
const ALL: &[&str] = &["H1", "KH", "H3"];
const KH_ONLY: &[&str] = &["KH"];

const FAULT_BITS: BitTable = &[
    (0, "grid_lost"),
    (1, "grid_voltage_fault"),
    (2, "grid_frequency_fault"),
    (3, "ten_minute_voltage_fault"),
    (4, "ground_fault"),
    (5, "dc_injection_fault"),
    (6, "isolation_fault"),
    (7, "bus_voltage_fault"),
    (8, "inverter_overtemperature"),
    (9, "battery_fault"),
    (10, "bms_lost"),
    (11, "fan_fault"),
];

const PERCENT: Validation = Validation::Range(0.0, 100.0);
const SOC_LIMIT: Validation = Validation::Range(10.0, 100.0);

pub(crate) static ENTRY_DEFINITIONS: &[EntryDefinition] = &[
    EntryDefinition::telemetry("pv1_voltage", ALL, Some(31_000), Some(11_000), U16).scale(0.1, "V"),
    EntryDefinition::telemetry("pv1_current", ALL, Some(31_001), Some(11_001), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("pv1_power", ALL, Some(31_002), Some(11_002), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("pv2_voltage", ALL, Some(31_003), Some(11_003), U16).scale(0.1, "V"),
    EntryDefinition::telemetry("pv2_current", ALL, Some(31_004), Some(11_004), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("pv2_power", ALL, Some(31_005), Some(11_005), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("pv3_voltage", KH_ONLY, Some(31_039), None, U16).scale(0.1, "V"),
    EntryDefinition::telemetry("pv3_current", KH_ONLY, Some(31_040), None, I16).scale(0.1, "A"),
    EntryDefinition::telemetry("pv3_power", KH_ONLY, Some(31_041), None, I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("pv4_voltage", KH_ONLY, Some(31_042), None, U16).scale(0.1, "V"),
    EntryDefinition::telemetry("pv4_current", KH_ONLY, Some(31_043), None, I16).scale(0.1, "A"),
    EntryDefinition::telemetry("pv4_power", KH_ONLY, Some(31_044), None, I16).scale(0.001, "kW"),
    // Single phase grid side.
    EntryDefinition::telemetry("rvolt", SINGLE_PHASE, Some(31_006), Some(11_009), U16).scale(0.1, "V"),
    EntryDefinition::telemetry("rcurrent", SINGLE_PHASE, Some(31_007), Some(11_010), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("rpower", SINGLE_PHASE, Some(31_008), Some(11_011), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("rfreq", SINGLE_PHASE, Some(31_009), Some(11_014), U16)
        .scale(0.01, "Hz")
        .validate(Validation::Range(45.0, 65.0)),
    // Three phase grid side.
    EntryDefinition::telemetry("rvolt", THREE_PHASE, Some(31_006), Some(11_009), U16).scale(0.1, "V"),
    EntryDefinition::telemetry("svolt", THREE_PHASE, Some(31_007), Some(11_010), U16).scale(0.1, "V"),
    EntryDefinition::telemetry("tvolt", THREE_PHASE, Some(31_008), Some(11_011), U16).scale(0.1, "V"),
    EntryDefinition::telemetry("rcurrent", THREE_PHASE, Some(31_009), Some(11_012), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("scurrent", THREE_PHASE, Some(31_010), Some(11_013), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("tcurrent", THREE_PHASE, Some(31_011), Some(11_014), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("rpower", THREE_PHASE, Some(31_012), Some(11_015), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("spower", THREE_PHASE, Some(31_013), Some(11_016), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("tpower", THREE_PHASE, Some(31_014), Some(11_017), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("rfreq", THREE_PHASE, Some(31_015), Some(11_018), U16)
        .scale(0.01, "Hz")
        .validate(Validation::Range(45.0, 65.0)),
    EntryDefinition::telemetry("grid_ct", ALL, Some(31_016), Some(11_021), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("load_power", ALL, Some(31_017), Some(11_023), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("invtemp", ALL, Some(31_018), Some(11_024), I16)
        .scale(0.1, "°C")
        .validate(Validation::Range(-40.0, 120.0)),
    EntryDefinition::telemetry("ambtemp", ALL, Some(31_019), Some(11_025), I16).scale(0.1, "°C"),
    // Battery.
    EntryDefinition::telemetry("invbatvolt", ALL, Some(31_020), Some(11_006), I16).scale(0.1, "V"),
    EntryDefinition::telemetry("invbatcurrent", ALL, Some(31_021), Some(11_007), I16).scale(0.1, "A"),
    EntryDefinition::telemetry("invbatpower", ALL, Some(31_022), Some(11_008), I16).scale(0.001, "kW"),
    EntryDefinition::telemetry("battery_temp", ALL, Some(31_023), Some(11_035), I16).scale(0.1, "°C"),
    EntryDefinition::telemetry("battery_soc", ALL, Some(31_024), Some(11_036), U16)
        .unit("%")
        .validate(PERCENT),
    EntryDefinition::telemetry("bms_kwh_remaining", ALL, Some(31_025), Some(11_037), U16).scale(0.01, "kWh"),
    EntryDefinition::telemetry("battery2_soc", ALL, Some(31_026), Some(11_038), U16)
        .unit("%")
        .validate(PERCENT)
        .when(second_bms_present),
    EntryDefinition::telemetry("inverter_state", ALL, Some(31_027), Some(11_056), U16),
    EntryDefinition::telemetry("fault_code", ALL, Some(31_031), Some(11_061), Bitfield(FAULT_BITS)),
    EntryDefinition::telemetry("inverter_clock", ALL, Some(31_050), Some(11_090), DataType::DateTime)
        .when(clock_supported),
    // Energy totals.
    EntryDefinition::telemetry("solar_energy_total", ALL, Some(32_000), Some(11_070), U32).scale(0.1, "kWh"),
    EntryDefinition::telemetry("feed_in_energy_total", ALL, Some(32_003), Some(11_073), U32).scale(0.1, "kWh"),
    EntryDefinition::telemetry("grid_consumption_energy_total", ALL, Some(32_006), Some(11_076), U32)
        .scale(0.1, "kWh"),
    EntryDefinition::telemetry("battery_charge_total", ALL, Some(32_009), Some(11_079), U32).scale(0.1, "kWh"),
    EntryDefinition::telemetry("battery_discharge_total", ALL, Some(32_012), Some(11_082), U32)
        .scale(0.1, "kWh"),
    // Settings.
    EntryDefinition::setting("work_mode", ALL, 41_000, U16).validate(Validation::Range(0.0, 2.0)),
    EntryDefinition::setting("time_period_1_enable_charge_from_grid", ALL, 41_001, U16)
        .validate(Validation::Range(0.0, 1.0)),
    EntryDefinition::setting("time_period_1_start", ALL, 41_002, TimeOfDay),
    EntryDefinition::setting("time_period_1_end", ALL, 41_003, TimeOfDay),
    EntryDefinition::setting("time_period_2_enable_charge_from_grid", ALL, 41_004, U16)
        .validate(Validation::Range(0.0, 1.0)),
    EntryDefinition::setting("time_period_2_start", ALL, 41_005, TimeOfDay),
    EntryDefinition::setting("time_period_2_end", ALL, 41_006, TimeOfDay),
    EntryDefinition::setting("min_soc", ALL, 41_009, U16).unit("%").validate(SOC_LIMIT),
    EntryDefinition::setting("max_soc", ALL, 41_010, U16).unit("%").validate(SOC_LIMIT),
    EntryDefinition::setting("min_soc_on_grid", ALL, 41_011, U16).unit("%").validate(SOC_LIMIT),
];

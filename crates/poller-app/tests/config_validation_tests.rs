use std::env;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use poller_app::{AppConfig, InverterConfig};
use register_map::ConnectionTypeKey;
use types::TransportKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("INVERTER_POLLER_CONFIG", fixture_path("config-valid.toml"));

    let config = AppConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.modbus.timeout_ms, 2_000);
    assert_eq!(config.setup_retry_ms, 15_000);

    let connections = config.connections().expect("connections");
    let garage = &connections[0];
    assert_eq!(garage.transport, TransportKind::Udp);
    assert_eq!(garage.connection_type, ConnectionTypeKey::Aux);
    assert_eq!(garage.poll_interval, Duration::from_secs(15));
    assert_eq!(garage.max_read, 8);

    let barn = &connections[1];
    assert_eq!(barn.poll_interval, Duration::from_secs(5));
    assert_eq!(barn.max_read, 20);
    assert_eq!(barn.model.as_deref(), Some("H3"));
    assert_eq!(barn.slave_id, 247);

    let shed = &connections[2];
    assert_eq!(shed.transport, TransportKind::Serial);
    assert_eq!(shed.baud_rate, 19_200);
    assert_eq!(shed.connection_key().endpoint, "/dev/ttyUSB0");

    env::remove_var("INVERTER_POLLER_CONFIG");
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("INVERTER_POLLER_CONFIG", fixture_path("config-valid.json"));

    let config = AppConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9100"));

    let house = &config.connections().expect("connections")[0];
    assert_eq!(house.connection_type, ConnectionTypeKey::Lan);
    assert_eq!(house.controller_config().model.as_deref(), Some("H1"));

    env::remove_var("INVERTER_POLLER_CONFIG");
}

#[test]
fn invalid_config_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("INVERTER_POLLER_CONFIG", fixture_path("config-invalid.toml"));

    let config = AppConfig::load().expect("load config");
    assert!(config.validate().is_err());

    env::remove_var("INVERTER_POLLER_CONFIG");
}

#[test]
fn env_overrides_apply_after_file() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("INVERTER_POLLER_CONFIG", fixture_path("config-valid.toml"));
    env::set_var("INVERTER_POLLER_TIMEOUT_MS", "750");
    env::set_var("INVERTER_POLLER_METRICS_LISTEN", "0.0.0.0:9200");

    let config = AppConfig::load().expect("load config");
    assert_eq!(config.modbus.timeout_ms, 750);
    assert_eq!(config.metrics_listen.as_deref(), Some("0.0.0.0:9200"));

    env::remove_var("INVERTER_POLLER_TIMEOUT_MS");
    env::remove_var("INVERTER_POLLER_METRICS_LISTEN");
    env::remove_var("INVERTER_POLLER_CONFIG");
}

fn inverter(name: &str, host: &str) -> InverterConfig {
    InverterConfig {
        name: name.to_string(),
        adapter: "direct".to_string(),
        protocol: None,
        host: host.to_string(),
        baud_rate: None,
        slave: 247,
        poll_interval_ms: None,
        max_read: None,
        model: None,
    }
}

fn with_inverters(inverters: Vec<InverterConfig>) -> AppConfig {
    AppConfig {
        inverters,
        ..AppConfig::default()
    }
}

#[test]
fn rejects_inverter_lists_that_cannot_run() {
    assert!(with_inverters(Vec::new()).validate().is_err());

    let duplicate_names = with_inverters(vec![
        inverter("house", "10.0.0.1:502"),
        inverter("house", "10.0.0.2:502"),
    ]);
    assert!(duplicate_names.validate().is_err());

    let shared_endpoint = with_inverters(vec![
        inverter("east", "10.0.0.1:502"),
        inverter("west", "10.0.0.1:502"),
    ]);
    assert!(shared_endpoint.validate().is_err());

    let mut second_slave = inverter("west", "10.0.0.1:502");
    second_slave.slave = 1;
    let shared_link = with_inverters(vec![inverter("east", "10.0.0.1:502"), second_slave]);
    shared_link.validate().expect("different slaves may share a link");
}

#[test]
fn rejects_bad_inverter_fields() {
    assert!(with_inverters(vec![inverter("front door", "10.0.0.1:502")])
        .validate()
        .is_err());
    assert!(with_inverters(vec![inverter("house", "10.0.0.1")]).validate().is_err());

    let mut unknown_adapter = inverter("house", "10.0.0.1:502");
    unknown_adapter.adapter = "carrier_pigeon".to_string();
    assert!(with_inverters(vec![unknown_adapter]).validate().is_err());

    let mut serial_on_direct = inverter("house", "/dev/ttyUSB0");
    serial_on_direct.protocol = Some(TransportKind::Serial);
    assert!(with_inverters(vec![serial_on_direct]).validate().is_err());

    let mut zero_interval = inverter("house", "10.0.0.1:502");
    zero_interval.poll_interval_ms = Some(0);
    assert!(with_inverters(vec![zero_interval]).validate().is_err());

    let mut zero_read = inverter("house", "10.0.0.1:502");
    zero_read.max_read = Some(0);
    assert!(with_inverters(vec![zero_read]).validate().is_err());

    let mut unknown_model = inverter("house", "10.0.0.1:502");
    unknown_model.model = Some("X9".to_string());
    assert!(with_inverters(vec![unknown_model]).validate().is_err());

    let mut config = with_inverters(vec![inverter("house", "10.0.0.1:502")]);
    config.modbus.timeout_ms = 0;
    assert!(config.validate().is_err());
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}

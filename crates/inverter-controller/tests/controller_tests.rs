use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use inverter_controller::{
    autodetect, ControllerConfig, ControllerError, ControllerHandle, ControllerState,
    InverterController, PollEvent,
};
use modbus_client::{ClientConfig, Connector, ModbusClient, ModbusLink};
use range_planner::RangePlanner;
use register_map::{ChargePeriod, ConnectionTypeKey, DataType, RegisterEntry};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use types::{ConnectionKey, PollResult, RegisterType, TransportKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Read(u16),
    Write(u16),
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<u16, u16>,
    /// Reads starting at these addresses answer with an exception.
    rejected_starts: HashSet<u16>,
    /// One-shot failures consumed by the next requests.
    failures: VecDeque<io::ErrorKind>,
    calls: Vec<Call>,
    connects: usize,
}

#[derive(Default)]
struct Device {
    state: Mutex<DeviceState>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Device {
    fn with_registers(registers: impl IntoIterator<Item = (u16, u16)>) -> Arc<Self> {
        let device = Arc::new(Self::default());
        device.state().registers.extend(registers);
        device
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().expect("device state")
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay") = delay;
    }

    fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    async fn request(&self, call: Call) -> io::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut state = self.state();
            state.calls.push(call);
            match state.failures.pop_front() {
                Some(kind) => Err(io::Error::new(kind, "scripted failure")),
                None => match call {
                    Call::Read(start) if state.rejected_starts.contains(&start) => {
                        Err(io::Error::new(io::ErrorKind::Other, "illegal data address"))
                    }
                    _ => Ok(()),
                },
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn read(&self, start: u16, count: u16) -> Vec<u16> {
        let state = self.state();
        (0..count)
            .map(|offset| state.registers.get(&(start + offset)).copied().unwrap_or(0))
            .collect()
    }
}

struct FakeConnector {
    device: Arc<Device>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> io::Result<Box<dyn ModbusLink>> {
        self.device.state().connects += 1;
        Ok(Box::new(FakeLink {
            device: Arc::clone(&self.device),
        }))
    }
}

struct FakeLink {
    device: Arc<Device>,
}

#[async_trait]
impl ModbusLink for FakeLink {
    async fn read_holding_registers(&mut self, _slave: u8, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.device.request(Call::Read(start)).await?;
        Ok(self.device.read(start, count))
    }

    async fn read_input_registers(&mut self, _slave: u8, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.device.request(Call::Read(start)).await?;
        Ok(self.device.read(start, count))
    }

    async fn write_single_register(&mut self, _slave: u8, address: u16, value: u16) -> io::Result<()> {
        self.device.request(Call::Write(address)).await?;
        self.device.state().registers.insert(address, value);
        Ok(())
    }

    async fn write_multiple_registers(&mut self, _slave: u8, address: u16, values: &[u16]) -> io::Result<()> {
        self.device.request(Call::Write(address)).await?;
        let mut state = self.device.state();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(address + offset as u16, *value);
        }
        Ok(())
    }
}

fn client(device: &Arc<Device>) -> Arc<ModbusClient> {
    Arc::new(ModbusClient::with_connector(
        ConnectionKey {
            transport: TransportKind::Tcp,
            endpoint: "192.0.2.20:502".to_string(),
        },
        ClientConfig {
            timeout_ms: 2_000,
            retry_count: 1,
            retry_backoff_ms: 1,
            retry_max_backoff_ms: 5,
        },
        Box::new(FakeConnector {
            device: Arc::clone(device),
        }),
    ))
}

fn config(name: &str, poll_interval: Duration) -> ControllerConfig {
    ControllerConfig {
        name: name.to_string(),
        slave_id: 247,
        poll_interval,
        max_read: 5,
        connection_type: ConnectionTypeKey::Lan,
        model: None,
    }
}

fn three_ranges() -> Vec<RegisterEntry> {
    vec![
        RegisterEntry::new("first", 100, RegisterType::Input, DataType::U16),
        RegisterEntry::new("second", 110, RegisterType::Input, DataType::U16).with_scale(0.1),
        RegisterEntry::new("third", 120, RegisterType::Input, DataType::I16),
    ]
}

fn settings() -> Vec<RegisterEntry> {
    vec![
        RegisterEntry::new("pv1_voltage", 100, RegisterType::Input, DataType::U16).with_scale(0.1),
        RegisterEntry::new("min_soc", 41_009, RegisterType::Holding, DataType::U16).writable(),
        RegisterEntry::new("time_period_1_start", 41_002, RegisterType::Holding, DataType::TimeOfDay)
            .writable(),
    ]
}

fn spawn(device: &Arc<Device>, name: &str, poll_interval: Duration, entries: Vec<RegisterEntry>) -> ControllerHandle {
    InverterController::with_entries(
        client(device),
        config(name, poll_interval),
        entries,
        &RangePlanner::new(5, 1),
    )
    .spawn()
}

async fn next_update(events: &mut broadcast::Receiver<PollEvent>) -> Arc<PollResult> {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time");
        match event {
            Ok(PollEvent::Updated(result)) => return result,
            Ok(PollEvent::CycleFailed { .. }) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("controller stopped publishing"),
        }
    }
}

#[tokio::test]
async fn protocol_error_on_one_range_keeps_the_others() {
    let device = Device::with_registers([(100, 7), (110, 2_305), (120, 0xFFFE)]);
    device.state().rejected_starts.insert(110);

    let handle = spawn(&device, "garage", Duration::from_secs(60), three_ranges());
    let mut events = handle.subscribe();
    let result = next_update(&mut events).await;

    assert_eq!(result.inverter, "garage");
    assert_eq!(result.get("first"), Some(&Value::Integer(7)));
    assert_eq!(result.get("third"), Some(&Value::Integer(-2)));
    assert!(result.get("second").is_none());
    assert!(result.unavailable.contains_key("second"));
    assert_eq!(device.calls(), vec![Call::Read(100), Call::Read(110), Call::Read(120)]);

    handle.shutdown().await;
}

#[tokio::test]
async fn connection_failure_aborts_cycle_and_polling_continues() {
    let device = Device::with_registers([(100, 1)]);
    {
        let mut state = device.state();
        state.failures.push_back(io::ErrorKind::ConnectionReset);
        state.failures.push_back(io::ErrorKind::ConnectionReset);
    }

    let handle = spawn(&device, "shed", Duration::from_millis(50), three_ranges());
    let mut events = handle.subscribe();

    let first = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert!(matches!(first, PollEvent::CycleFailed { .. }));

    let result = next_update(&mut events).await;
    assert_eq!(result.get("first"), Some(&Value::Integer(1)));
    assert!(device.state().connects >= 2);

    handle.shutdown().await;
}

async fn assert_write_runs_before_next_poll(poll_interval: Duration) {
    let device = Device::with_registers([]);
    device.set_delay(Duration::from_millis(50));
    let entries = vec![
        RegisterEntry::new("a", 100, RegisterType::Input, DataType::U16),
        RegisterEntry::new("b", 200, RegisterType::Input, DataType::U16),
        RegisterEntry::new("min_soc", 41_009, RegisterType::Holding, DataType::U16).writable(),
    ];

    let handle = spawn(&device, "loft", poll_interval, entries);
    let mut events = handle.subscribe();
    let mut state = handle.state_changes();
    state
        .wait_for(|state| *state == ControllerState::Polling)
        .await
        .expect("polling");

    handle
        .write_value("min_soc", Value::Integer(15))
        .await
        .expect("write");
    next_update(&mut events).await;
    next_update(&mut events).await;
    handle.shutdown().await;

    let calls = device.calls();
    assert_eq!(
        &calls[..7],
        &[
            Call::Read(100),
            Call::Read(200),
            Call::Read(41_009),
            Call::Write(41_009),
            Call::Read(100),
            Call::Read(200),
            Call::Read(41_009),
        ]
    );
    assert_eq!(device.state().registers.get(&41_009), Some(&15));
}

#[tokio::test]
async fn write_submitted_mid_poll_runs_before_next_poll() {
    assert_write_runs_before_next_poll(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn queued_write_wins_over_an_overdue_tick() {
    // One cycle takes three 50ms reads, so the next tick is already due when
    // the cycle ends.
    for _ in 0..5 {
        assert_write_runs_before_next_poll(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controllers_sharing_a_link_never_overlap() {
    let device = Device::with_registers([]);
    device.set_delay(Duration::from_millis(5));
    let shared = client(&device);

    let handles = ["east", "west"]
        .into_iter()
        .map(|name| {
            InverterController::with_entries(
                Arc::clone(&shared),
                config(name, Duration::from_millis(20)),
                settings(),
                &RangePlanner::new(5, 1),
            )
            .spawn()
        })
        .collect::<Vec<_>>();

    let mut subscriptions = handles.iter().map(ControllerHandle::subscribe).collect::<Vec<_>>();
    let writes = handles
        .iter()
        .map(|handle| {
            let handle = handle.clone();
            tokio::spawn(async move {
                for value in 10..15 {
                    handle
                        .write_value("min_soc", Value::Integer(value))
                        .await
                        .expect("write");
                }
            })
        })
        .collect::<Vec<_>>();

    for events in &mut subscriptions {
        for _ in 0..3 {
            next_update(events).await;
        }
    }
    for write in writes {
        write.await.expect("writer task");
    }
    for handle in &handles {
        handle.shutdown().await;
    }

    assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(device.calls().iter().filter(|call| matches!(call, Call::Write(_))).count() >= 10);
    assert_eq!(device.state().connects, 1);
}

#[tokio::test]
async fn write_retries_once_after_connection_error() {
    let device = Device::with_registers([]);
    let handle = spawn(&device, "barn", Duration::from_secs(60), settings());
    let mut events = handle.subscribe();
    next_update(&mut events).await;

    device.state().failures.push_back(io::ErrorKind::BrokenPipe);
    handle
        .write_registers(41_009, vec![25])
        .await
        .expect("write after reconnect");

    let state = device.state();
    assert_eq!(state.connects, 2);
    assert_eq!(state.registers.get(&41_009), Some(&25));
    drop(state);

    handle.shutdown().await;
}

#[tokio::test]
async fn write_value_checks_entry_and_encoding() {
    let device = Device::with_registers([]);
    let handle = spawn(&device, "attic", Duration::from_secs(60), settings());

    assert!(matches!(
        handle.write_value("unknown", Value::Integer(1)).await,
        Err(ControllerError::UnknownEntry(_))
    ));
    assert!(matches!(
        handle.write_value("pv1_voltage", Value::Float(230.0)).await,
        Err(ControllerError::NotWritable(_))
    ));
    assert!(matches!(
        handle.write_value("min_soc", Value::Float(10.5)).await,
        Err(ControllerError::Encode { .. })
    ));

    let start = NaiveTime::from_hms_opt(1, 30, 0).expect("time");
    handle
        .write_value("time_period_1_start", Value::Time(start))
        .await
        .expect("write time");
    assert_eq!(device.state().registers.get(&41_002), Some(&0x011E));

    handle.shutdown().await;
}

#[tokio::test]
async fn charge_periods_are_written_as_one_block() {
    let device = Device::with_registers([]);
    let handle = spawn(&device, "porch", Duration::from_secs(60), settings());

    let period = ChargePeriod {
        start: NaiveTime::from_hms_opt(2, 0, 0).expect("time"),
        end: NaiveTime::from_hms_opt(5, 30, 0).expect("time"),
        enable_charge_from_grid: true,
    };
    handle.update_charge_periods(&[period]).await.expect("update");

    let state = device.state();
    assert!(state.calls.contains(&Call::Write(41_001)));
    let block = (41_001..=41_006)
        .map(|address| state.registers.get(&address).copied().unwrap_or(0))
        .collect::<Vec<_>>();
    assert_eq!(block, vec![1, 0x0200, 0x051E, 0, 0, 0]);
    drop(state);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_the_controller() {
    let device = Device::with_registers([]);
    let handle = spawn(&device, "cellar", Duration::from_secs(60), settings());

    handle.shutdown().await;
    assert_eq!(handle.state(), ControllerState::Stopped);
    assert!(matches!(
        handle.write_registers(41_009, vec![1]).await,
        Err(ControllerError::Stopped)
    ));
}

fn identity(model: &str) -> Vec<(u16, u16)> {
    model
        .bytes()
        .chain(std::iter::repeat(b' '))
        .take(11)
        .enumerate()
        .map(|(offset, byte)| (30_000 + offset as u16, u16::from(byte)))
        .collect()
}

#[tokio::test]
async fn autodetect_matches_model_prefix() {
    let device = Device::with_registers(identity("H1-5.0-E"));
    let client = client(&device);

    let (base, full) = autodetect(&client, ConnectionTypeKey::Lan, 247)
        .await
        .expect("detect");
    assert_eq!(base, "H1");
    assert_eq!(full, "H1-5.0-E");
}

#[tokio::test]
async fn autodetect_reads_the_low_byte_of_each_register() {
    let registers = identity("KH10")
        .into_iter()
        .map(|(address, word)| (address, word | 0x2000));
    let device = Device::with_registers(registers);
    let client = client(&device);

    let (base, full) = autodetect(&client, ConnectionTypeKey::Lan, 247)
        .await
        .expect("detect");
    assert_eq!(base, "KH");
    assert_eq!(full, "KH10");
}

#[tokio::test]
async fn autodetect_rejects_unknown_models() {
    let device = Device::with_registers(identity("T10-G3"));
    let client = client(&device);

    let err = autodetect(&client, ConnectionTypeKey::Aux, 247)
        .await
        .expect_err("unsupported");
    assert!(matches!(err, ControllerError::UnsupportedModel(model) if model == "T10-G3"));
}

#[tokio::test]
async fn setup_resolves_catalog_and_plans_reads() {
    let mut registers = identity("AC3-10.0");
    registers.push((30_018, 160));
    let device = Device::with_registers(registers);

    let mut config = config("workshop", Duration::from_secs(60));
    config.connection_type = ConnectionTypeKey::Aux;
    config.max_read = 8;
    let controller = InverterController::setup(client(&device), config)
        .await
        .expect("setup");

    assert!(controller.entries().iter().any(|entry| entry.name == "pv1_voltage"));
    assert!(controller.entries().iter().any(|entry| entry.name == "inverter_clock"));
    assert!(controller.entries().iter().all(|entry| entry.name != "battery2_soc"));

    for (_, range) in controller.read_plan() {
        assert!(range.count <= 8);
        let crosses = u32::from(range.start_address) <= 11_089 && range.end_address() >= 11_085;
        assert!(!crosses, "range {range:?} crosses a no-read region");
    }
    for entry in controller.entries() {
        let covered = controller.read_plan().iter().any(|(register_type, range)| {
            *register_type == entry.register_type && range.contains(entry.address, entry.register_count())
        });
        assert!(covered, "{} not covered", entry.name);
    }
}

#[tokio::test]
async fn setup_with_model_hint_skips_detection() {
    let device = Device::with_registers([]);
    let mut config = config("hall", Duration::from_secs(60));
    config.model = Some("KH".to_string());
    config.max_read = 50;

    let controller = InverterController::setup(client(&device), config)
        .await
        .expect("setup");

    assert!(controller.entries().iter().any(|entry| entry.name == "pv4_power"));
    assert!(!device.calls().contains(&Call::Read(30_000)));
}

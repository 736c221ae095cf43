//! One polling actor per inverter.
//!
//! A controller owns the resolved register map and its cached read plan,
//! polls on a fixed interval, publishes decoded values to subscribers and
//! funnels writes through the same task so a write never lands in the
//! middle of a poll cycle.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use metrics::{counter, histogram};
use modbus_client::{ClientError, ModbusClient};
use range_planner::{RangePlanner, ReadPlanRange};
use register_map::{
    charge_period_words, entries_for, find_model, ChargePeriod, ConnectionTypeKey, InverterModel,
    MapError, RegisterEntry,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::{PollResult, RegisterType, Value};
use value_codec::{decode, encode, EncodeError};

mod detect;

pub use detect::autodetect;

const EVENT_CAPACITY: usize = 16;
const WRITE_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Label used in logs, metrics and published results.
    pub name: String,
    pub slave_id: u8,
    pub poll_interval: Duration,
    /// Largest register span requested in one read.
    pub max_read: u16,
    pub connection_type: ConnectionTypeKey,
    /// Base model (e.g. `H1`); autodetected when absent.
    pub model: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "inverter".to_string(),
            slave_id: 247,
            poll_interval: Duration::from_secs(10),
            max_read: 100,
            connection_type: ConnectionTypeKey::Lan,
            model: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("unsupported inverter model {0:?}")]
    UnsupportedModel(String),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("no register named {0}")]
    UnknownEntry(String),
    #[error("register {0} is read-only")]
    NotWritable(String),
    #[error("cannot encode value for {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: EncodeError,
    },
    #[error("controller stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Polling,
    Decoding,
    Publishing,
    WriteInFlight,
    Stopped,
}

#[derive(Debug, Clone)]
pub enum PollEvent {
    Updated(Arc<PollResult>),
    /// The link failed part way through; nothing was published this cycle.
    CycleFailed { reason: String },
}

struct PendingWrite {
    address: u16,
    values: Vec<u16>,
    reply: oneshot::Sender<Result<(), ControllerError>>,
}

/// A configured controller that has not started polling yet.
pub struct InverterController {
    client: Arc<ModbusClient>,
    config: ControllerConfig,
    entries: Arc<[RegisterEntry]>,
    plans: Vec<(RegisterType, ReadPlanRange)>,
}

impl InverterController {
    /// Resolves the register map for the inverter behind `client`: detects
    /// the model unless configured, reads the probe registers, then plans the
    /// range reads once.
    pub async fn setup(client: Arc<ModbusClient>, config: ControllerConfig) -> Result<Self, ControllerError> {
        let model = match config.model.as_deref() {
            Some(base) => find_model(base)?,
            None => {
                let (base, _) = autodetect(&client, config.connection_type, config.slave_id).await?;
                find_model(base)?
            }
        };

        let probes = detect::read_probes(&client, model, config.connection_type, config.slave_id).await?;
        let entries = entries_for(model, config.connection_type, &probes)?;
        let planner = planner_for(model, config.connection_type, config.max_read, &entries);

        info!(
            inverter = %config.name,
            model = model.base_model,
            connection_type = %config.connection_type,
            entries = entries.len(),
            "inverter controller ready"
        );
        Ok(Self::with_entries(client, config, entries, &planner))
    }

    /// Builds a controller from an already resolved entry list.
    pub fn with_entries(
        client: Arc<ModbusClient>,
        config: ControllerConfig,
        entries: Vec<RegisterEntry>,
        planner: &RangePlanner,
    ) -> Self {
        let mut plans = Vec::new();
        for register_type in [RegisterType::Input, RegisterType::Holding] {
            let spans = entries
                .iter()
                .filter(|entry| entry.register_type == register_type)
                .map(|entry| (entry.address, entry.register_count()));
            plans.extend(
                planner
                    .plan_spans(spans)
                    .into_iter()
                    .map(|range| (register_type, range)),
            );
        }

        debug!(inverter = %config.name, ranges = plans.len(), "read plan cached");
        Self {
            client,
            config,
            entries: entries.into(),
            plans,
        }
    }

    pub fn entries(&self) -> &[RegisterEntry] {
        &self.entries
    }

    pub fn read_plan(&self) -> &[(RegisterType, ReadPlanRange)] {
        &self.plans
    }

    /// Starts the polling task.
    pub fn spawn(self) -> ControllerHandle {
        let (writes_tx, writes_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ControllerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = ControllerHandle {
            name: self.config.name.clone(),
            entries: Arc::clone(&self.entries),
            writes: writes_tx,
            events: events_tx.clone(),
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
        };

        let actor = Actor {
            client: self.client,
            config: self.config,
            entries: self.entries,
            plans: self.plans,
            events: events_tx,
            state: state_tx,
        };
        tokio::spawn(actor.run(writes_rx, shutdown_rx));
        handle
    }
}

/// Builds the planner for a model. The span is never smaller than the widest
/// entry so every entry fits one read.
pub fn planner_for(
    model: &InverterModel,
    key: ConnectionTypeKey,
    max_read: u16,
    entries: &[RegisterEntry],
) -> RangePlanner {
    let widest = entries
        .iter()
        .map(RegisterEntry::register_count)
        .max()
        .unwrap_or(1);
    RangePlanner::new(max_read.max(widest), model.max_gap).with_no_read_across(model.no_read_across(key))
}

/// Cheap, cloneable access to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    name: String,
    entries: Arc<[RegisterEntry]>,
    writes: mpsc::Sender<PendingWrite>,
    events: broadcast::Sender<PollEvent>,
    state: watch::Receiver<ControllerState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ControllerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[RegisterEntry] {
        &self.entries
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    /// Queues raw words for the holding registers starting at `address` and
    /// waits for the outcome. Queued writes run before the next poll.
    pub async fn write_registers(&self, address: u16, values: Vec<u16>) -> Result<(), ControllerError> {
        let (reply, response) = oneshot::channel();
        self.writes
            .send(PendingWrite {
                address,
                values,
                reply,
            })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        response.await.map_err(|_| ControllerError::Stopped)?
    }

    /// Encodes `value` for the named writable entry and writes it.
    pub async fn write_value(&self, name: &str, value: Value) -> Result<(), ControllerError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| ControllerError::UnknownEntry(name.to_string()))?;
        if !entry.writable {
            return Err(ControllerError::NotWritable(name.to_string()));
        }
        let words = encode(&value, entry).map_err(|source| ControllerError::Encode {
            name: name.to_string(),
            source,
        })?;
        self.write_registers(entry.address, words).await
    }

    /// Writes both charge period blocks in one request.
    pub async fn update_charge_periods(&self, periods: &[ChargePeriod]) -> Result<(), ControllerError> {
        let (address, words) = charge_period_words(periods)?;
        self.write_registers(address, words).await
    }

    /// Stops the timer and waits for the task to finish its current
    /// operation. Writes still queued are failed with `Stopped`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ControllerState::Stopped)
            .await;
    }
}

struct Actor {
    client: Arc<ModbusClient>,
    config: ControllerConfig,
    entries: Arc<[RegisterEntry]>,
    plans: Vec<(RegisterType, ReadPlanRange)>,
    events: broadcast::Sender<PollEvent>,
    state: watch::Sender<ControllerState>,
}

impl Actor {
    async fn run(self, mut writes: mpsc::Receiver<PendingWrite>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(write) = writes.recv() => {
                    self.execute_write(write).await;
                }
                _ = ticker.tick() => {
                    while let Ok(write) = writes.try_recv() {
                        self.execute_write(write).await;
                    }
                    self.poll_cycle().await;
                }
            }
        }

        info!(inverter = %self.config.name, "controller shutdown requested");
        writes.close();
        while let Ok(write) = writes.try_recv() {
            let _ = write.reply.send(Err(ControllerError::Stopped));
        }
        self.state.send_replace(ControllerState::Stopped);
    }

    async fn execute_write(&self, write: PendingWrite) {
        self.state.send_replace(ControllerState::WriteInFlight);
        let result = self
            .client
            .write_registers(self.config.slave_id, write.address, &write.values)
            .await
            .map_err(ControllerError::from);

        let outcome = match &result {
            Ok(()) => {
                info!(
                    inverter = %self.config.name,
                    address = write.address,
                    count = write.values.len(),
                    "registers written"
                );
                "ok"
            }
            Err(err) => {
                warn!(
                    inverter = %self.config.name,
                    address = write.address,
                    count = write.values.len(),
                    error = %err,
                    "register write failed"
                );
                "error"
            }
        };
        counter!("inverter_writes_total", "inverter" => self.config.name.clone(), "outcome" => outcome)
            .increment(1);

        let _ = write.reply.send(result);
        self.state.send_replace(ControllerState::Idle);
    }

    async fn poll_cycle(&self) {
        let started = Instant::now();
        self.state.send_replace(ControllerState::Polling);

        let mut blocks: Vec<(RegisterType, ReadPlanRange, Result<Vec<u16>, String>)> =
            Vec::with_capacity(self.plans.len());
        for (register_type, range) in &self.plans {
            let read = self
                .client
                .read_registers(self.config.slave_id, *register_type, range.start_address, range.count)
                .await;
            match read {
                Ok(words) => blocks.push((*register_type, *range, Ok(words))),
                Err(err) if err.is_connection() => {
                    warn!(
                        inverter = %self.config.name,
                        start = range.start_address,
                        count = range.count,
                        error = %err,
                        "poll cycle aborted"
                    );
                    counter!("inverter_poll_failures_total", "inverter" => self.config.name.clone())
                        .increment(1);
                    let _ = self.events.send(PollEvent::CycleFailed {
                        reason: err.to_string(),
                    });
                    self.state.send_replace(ControllerState::Idle);
                    return;
                }
                Err(err) => {
                    warn!(
                        inverter = %self.config.name,
                        start = range.start_address,
                        count = range.count,
                        error = %err,
                        "range read rejected"
                    );
                    blocks.push((*register_type, *range, Err(err.to_string())));
                }
            }
        }

        self.state.send_replace(ControllerState::Decoding);
        let mut result = PollResult::new(self.config.name.clone(), unix_ms());
        for entry in self.entries.iter() {
            match entry_words(&blocks, entry) {
                Some(Ok(words)) => match decode(words, entry) {
                    Ok(value) => {
                        result.values.insert(entry.name.to_string(), value);
                    }
                    Err(err) => {
                        debug!(inverter = %self.config.name, name = entry.name, error = %err, "value unavailable");
                        result.unavailable.insert(entry.name.to_string(), err.to_string());
                    }
                },
                Some(Err(reason)) => {
                    result.unavailable.insert(entry.name.to_string(), reason);
                }
                None => {
                    result
                        .unavailable
                        .insert(entry.name.to_string(), "not covered by read plan".to_string());
                }
            }
        }

        self.state.send_replace(ControllerState::Publishing);
        let elapsed = started.elapsed();
        info!(
            inverter = %self.config.name,
            elapsed_ms = elapsed.as_millis() as u64,
            values = result.values.len(),
            unavailable = result.unavailable.len(),
            "poll cycle complete"
        );
        counter!("inverter_poll_cycles_total", "inverter" => self.config.name.clone()).increment(1);
        histogram!("inverter_poll_duration_ms", "inverter" => self.config.name.clone())
            .record(elapsed.as_secs_f64() * 1_000.0);

        // No subscribers is not an error.
        let _ = self.events.send(PollEvent::Updated(Arc::new(result)));
        self.state.send_replace(ControllerState::Idle);
    }
}

/// The words of `entry` within the block that covers it, or the reason that
/// block could not be read.
fn entry_words<'a>(
    blocks: &'a [(RegisterType, ReadPlanRange, Result<Vec<u16>, String>)],
    entry: &RegisterEntry,
) -> Option<Result<&'a [u16], String>> {
    let (_, range, words) = blocks.iter().find(|(register_type, range, _)| {
        *register_type == entry.register_type && range.contains(entry.address, entry.register_count())
    })?;
    Some(match words {
        Ok(words) => {
            let offset = usize::from(entry.address - range.start_address);
            let end = offset + usize::from(entry.register_count());
            words.get(offset..end).ok_or_else(|| "short read".to_string())
        }
        Err(reason) => Err(reason.clone()),
    })
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

use std::cmp::min;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use types::{ConnectionKey, RegisterType, TransportKind};

mod pool;
mod transport;

pub use pool::{ClientPool, ConnectorFactory};
pub use transport::{Connector, ModbusLink};

use transport::{SerialConnector, TcpConnector, UdpConnector};

pub const DEFAULT_BAUD_RATE: u32 = 9_600;

/// Options shared by every link in a pool.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout in milliseconds; also bounds connecting.
    pub timeout_ms: u64,
    /// Reconnect-and-retry attempts after a connection failure.
    pub retry_count: usize,
    /// Base delay before reconnecting, doubled per attempt.
    pub retry_backoff_ms: u64,
    /// Upper bound for the reconnect delay.
    pub retry_max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            retry_count: 1,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint {0}")]
    InvalidAddress(String),
    #[error("modbus connection error: {0}")]
    Connection(#[source] io::Error),
    #[error("modbus protocol error: {0}")]
    Protocol(#[source] io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("register address overflow")]
    AddressOverflow,
}

impl ClientError {
    /// Transient failures that justify dropping and reopening the link.
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Timeout { .. })
    }

    /// Splits link-level I/O errors from the device answering with an
    /// exception or a frame that does not fit the request.
    fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::Other => ClientError::Protocol(err),
            _ => ClientError::Connection(err),
        }
    }
}

enum Operation<'a> {
    Read(RegisterType, u16, u16),
    WriteSingle(u16, u16),
    WriteMultiple(u16, &'a [u16]),
}

impl Operation<'_> {
    fn name(&self) -> &'static str {
        match self {
            Operation::Read(RegisterType::Holding, _, _) => "read_holding",
            Operation::Read(RegisterType::Input, _, _) => "read_input",
            Operation::WriteSingle(_, _) => "write_single",
            Operation::WriteMultiple(_, _) => "write_multiple",
        }
    }

    fn address(&self) -> u16 {
        match self {
            Operation::Read(_, address, _)
            | Operation::WriteSingle(address, _)
            | Operation::WriteMultiple(address, _) => *address,
        }
    }

    async fn run(&self, link: &mut dyn ModbusLink, slave: u8) -> io::Result<Vec<u16>> {
        match *self {
            Operation::Read(RegisterType::Holding, start, count) => {
                link.read_holding_registers(slave, start, count).await
            }
            Operation::Read(RegisterType::Input, start, count) => {
                link.read_input_registers(slave, start, count).await
            }
            Operation::WriteSingle(address, value) => link
                .write_single_register(slave, address, value)
                .await
                .map(|()| Vec::new()),
            Operation::WriteMultiple(address, values) => link
                .write_multiple_registers(slave, address, values)
                .await
                .map(|()| Vec::new()),
        }
    }
}

/// A single physical Modbus link shared by every inverter behind it.
///
/// The link sits behind an async mutex that is held for exactly one
/// operation (including its reconnect retry), so requests from different
/// callers never interleave on the wire and run in the order they queued.
pub struct ModbusClient {
    key: ConnectionKey,
    config: ClientConfig,
    connector: Box<dyn Connector>,
    link: Mutex<Option<Box<dyn ModbusLink>>>,
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ModbusClient {
    /// Builds a client for a real endpoint. Nothing is opened until the first
    /// operation or an explicit [`ModbusClient::connect`].
    pub fn new(key: ConnectionKey, baud_rate: u32, config: ClientConfig) -> Result<Self, ClientError> {
        let connector = default_connector(&key, baud_rate)?;
        Ok(Self::with_connector(key, config, connector))
    }

    pub fn with_connector(key: ConnectionKey, config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            key,
            config,
            connector,
            link: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Opens the link if it is not already open.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut slot = self.link.lock().await;
        self.open(&mut slot).await.map(|_| ())
    }

    pub async fn ensure_connected(&self) -> Result<(), ClientError> {
        self.connect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Drops the link; the next operation reconnects.
    pub async fn close(&self) {
        if self.link.lock().await.take().is_some() {
            debug!(endpoint = %self.key, "modbus link closed");
        }
    }

    pub async fn read_registers(
        &self,
        slave: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        check_span(start, count)?;
        let values = self
            .execute(slave, Operation::Read(register_type, start, count))
            .await?;
        if values.len() != usize::from(count) {
            return Err(ClientError::Protocol(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {count} registers, got {}", values.len()),
            )));
        }
        Ok(values)
    }

    pub async fn write_register(&self, slave: u8, address: u16, value: u16) -> Result<(), ClientError> {
        self.execute(slave, Operation::WriteSingle(address, value))
            .await
            .map(|_| ())
    }

    pub async fn write_registers(&self, slave: u8, address: u16, values: &[u16]) -> Result<(), ClientError> {
        match values {
            [] => Ok(()),
            [value] => self.write_register(slave, address, *value).await,
            _ => {
                let count = u16::try_from(values.len()).map_err(|_| ClientError::AddressOverflow)?;
                check_span(address, count)?;
                self.execute(slave, Operation::WriteMultiple(address, values))
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn execute(&self, slave: u8, operation: Operation<'_>) -> Result<Vec<u16>, ClientError> {
        let mut slot = self.link.lock().await;
        let mut attempts = 0usize;

        loop {
            let result = match self.open(&mut slot).await {
                Ok(link) => {
                    let request = operation.run(link.as_mut(), slave);
                    match timeout(Duration::from_millis(self.config.timeout_ms), request).await {
                        Ok(Ok(values)) => Ok(values),
                        Ok(Err(err)) => Err(ClientError::classify(err)),
                        Err(_) => Err(ClientError::Timeout {
                            timeout_ms: self.config.timeout_ms,
                        }),
                    }
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(values) => {
                    debug!(
                        endpoint = %self.key,
                        slave,
                        operation = operation.name(),
                        address = operation.address(),
                        "modbus operation ok"
                    );
                    return Ok(values);
                }
                Err(err) if err.is_connection() => {
                    // A late response would desynchronise the framing.
                    *slot = None;
                    warn!(
                        endpoint = %self.key,
                        slave,
                        operation = operation.name(),
                        address = operation.address(),
                        attempt = attempts + 1,
                        error = %err,
                        "modbus link failed"
                    );
                    if attempts >= self.config.retry_count {
                        return Err(err);
                    }
                    let delay_ms = self.retry_delay_ms(attempts);
                    attempts += 1;
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(err) => {
                    warn!(
                        endpoint = %self.key,
                        slave,
                        operation = operation.name(),
                        address = operation.address(),
                        error = %err,
                        "modbus request rejected"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn open<'a>(
        &self,
        slot: &'a mut Option<Box<dyn ModbusLink>>,
    ) -> Result<&'a mut Box<dyn ModbusLink>, ClientError> {
        if slot.is_none() {
            let connect = self.connector.connect();
            let link = match timeout(Duration::from_millis(self.config.timeout_ms), connect).await {
                Ok(Ok(link)) => link,
                Ok(Err(err)) => return Err(ClientError::Connection(err)),
                Err(_) => {
                    return Err(ClientError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    })
                }
            };
            debug!(endpoint = %self.key, "modbus link opened");
            *slot = Some(link);
        }
        slot.as_mut().ok_or_else(|| {
            ClientError::Connection(io::Error::new(io::ErrorKind::NotConnected, "link unavailable"))
        })
    }

    fn retry_delay_ms(&self, attempt: usize) -> u64 {
        let base = self.config.retry_backoff_ms.max(1);
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        let max = self.config.retry_max_backoff_ms.max(base);
        min(delay, max)
    }
}

fn check_span(start: u16, count: u16) -> Result<(), ClientError> {
    if u32::from(start) + u32::from(count) - 1 > u32::from(u16::MAX) {
        return Err(ClientError::AddressOverflow);
    }
    Ok(())
}

fn default_connector(key: &ConnectionKey, baud_rate: u32) -> Result<Box<dyn Connector>, ClientError> {
    match key.transport {
        TransportKind::Tcp | TransportKind::Udp => {
            let valid = key
                .endpoint
                .rsplit_once(':')
                .map_or(false, |(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ClientError::InvalidAddress(key.endpoint.clone()));
            }
            let endpoint = key.endpoint.clone();
            Ok(match key.transport {
                TransportKind::Tcp => Box::new(TcpConnector { endpoint }),
                _ => Box::new(UdpConnector { endpoint }),
            })
        }
        TransportKind::Serial => {
            if key.endpoint.trim().is_empty() {
                return Err(ClientError::InvalidAddress(key.endpoint.clone()));
            }
            Ok(Box::new(SerialConnector {
                device: key.endpoint.clone(),
                baud_rate,
            }))
        }
    }
}

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, UdpSocket};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};
use tokio_serial::SerialStream;
use tracing::debug;

/// One open Modbus link. Implementations are used by one caller at a time.
#[async_trait]
pub trait ModbusLink: Send {
    async fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> io::Result<Vec<u16>>;

    async fn read_input_registers(&mut self, slave: u8, start: u16, count: u16) -> io::Result<Vec<u16>>;

    async fn write_single_register(&mut self, slave: u8, address: u16, value: u16) -> io::Result<()>;

    async fn write_multiple_registers(&mut self, slave: u8, address: u16, values: &[u16]) -> io::Result<()>;
}

/// Opens links to one endpoint; called again after a link is dropped.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn ModbusLink>>;
}

struct ContextLink {
    context: Context,
}

#[async_trait]
impl ModbusLink for ContextLink {
    async fn read_holding_registers(&mut self, slave: u8, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.context.set_slave(Slave(slave));
        self.context.read_holding_registers(start, count).await
    }

    async fn read_input_registers(&mut self, slave: u8, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.context.set_slave(Slave(slave));
        self.context.read_input_registers(start, count).await
    }

    async fn write_single_register(&mut self, slave: u8, address: u16, value: u16) -> io::Result<()> {
        self.context.set_slave(Slave(slave));
        self.context.write_single_register(address, value).await
    }

    async fn write_multiple_registers(&mut self, slave: u8, address: u16, values: &[u16]) -> io::Result<()> {
        self.context.set_slave(Slave(slave));
        self.context.write_multiple_registers(address, values).await
    }
}

async fn resolve(endpoint: &str) -> io::Result<SocketAddr> {
    lookup_host(endpoint).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {endpoint}"))
    })
}

pub(crate) struct TcpConnector {
    pub(crate) endpoint: String,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn ModbusLink>> {
        let addr = resolve(&self.endpoint).await?;
        let context = tcp::connect(addr).await?;
        debug!(endpoint = %self.endpoint, "modbus tcp connected");
        Ok(Box::new(ContextLink { context }))
    }
}

/// Modbus TCP framing carried in UDP datagrams, as spoken by most
/// RS485-to-WiFi bridges.
pub(crate) struct UdpConnector {
    pub(crate) endpoint: String,
}

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self) -> io::Result<Box<dyn ModbusLink>> {
        let addr = resolve(&self.endpoint).await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        let context = tcp::attach_slave(DatagramStream { socket }, Slave(1));
        debug!(endpoint = %self.endpoint, "modbus udp attached");
        Ok(Box::new(ContextLink { context }))
    }
}

pub(crate) struct SerialConnector {
    pub(crate) device: String,
    pub(crate) baud_rate: u32,
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> io::Result<Box<dyn ModbusLink>> {
        let builder = tokio_serial::new(&self.device, self.baud_rate)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .data_bits(tokio_serial::DataBits::Eight)
            .flow_control(tokio_serial::FlowControl::None);
        let port = SerialStream::open(&builder)?;
        let context = rtu::attach_slave(port, Slave(1));
        debug!(device = %self.device, baud_rate = self.baud_rate, "modbus rtu attached");
        Ok(Box::new(ContextLink { context }))
    }
}

/// Presents a connected UDP socket as a byte stream: every write is one
/// datagram and every read yields one datagram.
#[derive(Debug)]
struct DatagramStream {
    socket: UdpSocket,
}

impl AsyncRead for DatagramStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for DatagramStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

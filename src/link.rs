//! # Links to the drone
//!
//! A connection to the drone is made of three resources:
//! - the command link, on which AT commands are sent
//! - the telemetry link, on which the navdata is received
//! - the control channel, reserved for configuration file transfers
//!
//! Each of them is abstracted by a trait so that the connection logic can be
//! exercised without a drone. [UdpTransport] is the implementation used with
//! a real drone.
//!
//! Closing a link is done through a shared reference because the link is used
//! concurrently by a background task. After a link is closed, any pending or
//! future I/O on it fails with [io::ErrorKind::NotConnected].

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::debug;

use crate::DroneConfig;

// Datagram sent to the navdata port to ask the drone to start streaming
const NAVDATA_STREAM_REQUEST: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Outbound link, sends one command per datagram
pub trait CommandLink: Send + Sync + 'static {
    /// Send one datagram to the drone
    fn send(&self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Close the link
    fn close(&self) -> io::Result<()>;
}

/// Inbound link, receives one navdata datagram at a time
pub trait TelemetryLink: Send + Sync + 'static {
    /// Wait for one datagram
    ///
    /// # Returns
    ///
    /// The number of bytes written in `buf`
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Close the link, a pending [recv](Self::recv) fails
    fn close(&self) -> io::Result<()>;
}

/// Reserved control channel
pub trait ControlLink: Send + Sync + 'static {
    /// Close the channel
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Factory for the links of one connection
pub trait Transport: Send + Sync + 'static {
    /// Command link type
    type Command: CommandLink;
    /// Telemetry link type
    type Telemetry: TelemetryLink;
    /// Control channel type
    type Control: ControlLink;

    /// Open the command link, on an ephemeral local port
    fn open_command(&self, config: &DroneConfig) -> impl Future<Output = io::Result<Self::Command>> + Send;

    /// Open the telemetry link, bound to the navdata port
    fn open_telemetry(&self, config: &DroneConfig) -> impl Future<Output = io::Result<Self::Telemetry>> + Send;

    /// Open the control channel
    ///
    /// # Returns
    ///
    /// `None` when the control channel is not used
    fn open_control(&self, config: &DroneConfig) -> impl Future<Output = io::Result<Option<Self::Control>>> + Send;
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "link closed")
}

/// Transport over the drone WiFi network
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

/// UDP command link
#[derive(Debug)]
pub struct UdpCommandLink {
    socket: UdpSocket,
    destination: SocketAddr,
    closed: watch::Sender<bool>,
}

impl UdpCommandLink {
    /// Local address of the socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl CommandLink for UdpCommandLink {
    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        if *self.closed.borrow() {
            return Err(not_connected());
        }
        self.socket.send_to(frame, self.destination).await?;
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// UDP telemetry link
#[derive(Debug)]
pub struct UdpTelemetryLink {
    socket: UdpSocket,
    closed: watch::Sender<bool>,
}

impl UdpTelemetryLink {
    /// Local address of the socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl TelemetryLink for UdpTelemetryLink {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(not_connected());
        }
        let closed_signal = async {
            let _ = closed.wait_for(|closed| *closed).await;
        };
        tokio::select! {
            received = self.socket.recv_from(buf) => received.map(|(len, _from)| len),
            _ = closed_signal => Err(not_connected()),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// TCP control channel
#[derive(Debug)]
pub struct TcpControlLink {
    stream: tokio::sync::Mutex<TcpStream>,
}

impl ControlLink for TcpControlLink {
    async fn close(&self) -> io::Result<()> {
        self.stream.lock().await.shutdown().await
    }
}

impl Transport for UdpTransport {
    type Command = UdpCommandLink;
    type Telemetry = UdpTelemetryLink;
    type Control = TcpControlLink;

    async fn open_command(&self, config: &DroneConfig) -> io::Result<UdpCommandLink> {
        let socket = UdpSocket::bind(config.command_bind_addr()).await?;
        debug!("Command socket bound to {}", socket.local_addr()?);
        Ok(UdpCommandLink { socket, destination: config.command_addr(), closed: watch::Sender::new(false) })
    }

    async fn open_telemetry(&self, config: &DroneConfig) -> io::Result<UdpTelemetryLink> {
        let socket = UdpSocket::bind(config.navdata_bind_addr()).await?;
        debug!("Navdata socket bound to {}", socket.local_addr()?);
        socket.send_to(&NAVDATA_STREAM_REQUEST, config.navdata_addr()).await?;
        Ok(UdpTelemetryLink { socket, closed: watch::Sender::new(false) })
    }

    async fn open_control(&self, config: &DroneConfig) -> io::Result<Option<TcpControlLink>> {
        if !config.open_control_channel {
            return Ok(None);
        }
        let stream = TcpStream::connect(config.control_addr()).await?;
        Ok(Some(TcpControlLink { stream: tokio::sync::Mutex::new(stream) }))
    }
}

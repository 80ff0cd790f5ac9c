use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::{COMMAND_PORT, CONTROL_PORT, DEFAULT_DRONE_ADDRESS, NAVDATA_PORT};

// Bounded receive used by the navdata reader so that it can notice a stop request
const READER_POLL_INTERVAL: Duration = Duration::from_millis(100);
// Maximum time given to the navdata reader to exit when the link is closed
const READER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Link configuration
///
/// The defaults match the AR.Drone network layout. The ports are fixed by the
/// drone firmware and should only be changed to talk to a simulator or in tests.
///
/// # Example
///
/// ```
/// use ardrone::DroneConfig;
/// use std::net::Ipv4Addr;
///
/// let config = DroneConfig::default().with_address(Ipv4Addr::new(192, 168, 1, 10).into());
/// assert_eq!(config.command_addr().port(), 5559);
/// ```
#[derive(Debug, Clone)]
pub struct DroneConfig {
    /// Address of the drone
    pub address: IpAddr,
    /// Local address the client sockets are bound to
    pub local_address: IpAddr,
    /// Navdata port, bound locally and used as destination for the stream request
    pub navdata_port: u16,
    /// AT command port on the drone
    pub command_port: u16,
    /// Control channel port on the drone
    pub control_port: u16,
    /// Open the TCP control channel on connect
    pub open_control_channel: bool,
    /// Receive timeout after which the navdata reader checks for a stop request
    pub reader_poll_interval: Duration,
    /// Time given to the navdata reader to exit during disconnection
    pub reader_stop_timeout: Duration,
}

impl Default for DroneConfig {
    fn default() -> Self {
        DroneConfig {
            address: IpAddr::V4(DEFAULT_DRONE_ADDRESS),
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            navdata_port: NAVDATA_PORT,
            command_port: COMMAND_PORT,
            control_port: CONTROL_PORT,
            open_control_channel: false,
            reader_poll_interval: READER_POLL_INTERVAL,
            reader_stop_timeout: READER_STOP_TIMEOUT,
        }
    }
}

impl DroneConfig {
    /// Set the drone address
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    /// Set the local address the sockets are bound to
    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = address;
        self
    }

    /// Set the navdata port
    pub fn with_navdata_port(mut self, port: u16) -> Self {
        self.navdata_port = port;
        self
    }

    /// Set the drone AT command port
    pub fn with_command_port(mut self, port: u16) -> Self {
        self.command_port = port;
        self
    }

    /// Enable or disable the TCP control channel
    pub fn with_control_channel(mut self, enabled: bool) -> Self {
        self.open_control_channel = enabled;
        self
    }

    /// Set the navdata reader receive timeout
    pub fn with_reader_poll_interval(mut self, interval: Duration) -> Self {
        self.reader_poll_interval = interval;
        self
    }

    /// Set the time allowed for the navdata reader to stop
    pub fn with_reader_stop_timeout(mut self, timeout: Duration) -> Self {
        self.reader_stop_timeout = timeout;
        self
    }

    /// Destination of the AT commands
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.command_port)
    }

    /// Drone side of the navdata stream
    pub fn navdata_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.navdata_port)
    }

    /// Drone side of the control channel
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.control_port)
    }

    /// Local address the navdata socket is bound to
    pub fn navdata_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.navdata_port)
    }

    /// Local address of the command socket, on an ephemeral port
    pub fn command_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, 0)
    }
}

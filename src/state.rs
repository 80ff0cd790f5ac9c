use std::fmt::Display;

/// State of the link with the drone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link is open
    Disconnected,
    /// The link is open and the drone is (re)initializing
    Bootstrap,
    /// The link is open and navdata is delivered to the application
    Ready,
    /// Reserved for stalled navdata detection, never entered by this crate
    Watchdog,
    /// Opening the link failed, or the link was torn down after a failure
    Error,
}

impl ConnectionState {
    /// True when the link resources are open in this state
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Bootstrap | ConnectionState::Ready | ConnectionState::Watchdog
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Bootstrap => write!(f, "Bootstrap"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Watchdog => write!(f, "Watchdog"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

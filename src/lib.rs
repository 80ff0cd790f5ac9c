//! # Crate to control the Parrot AR.Drone
//!
//! This crate provides a client for the AR.Drone 1.0/2.0 quadcopter over its
//! WiFi network. The drone is controlled with two independent UDP streams:
//! - AT commands sent by the client to the drone command port (5559)
//! - Navigation data (navdata) sent by the drone to the client on port 5554
//!
//! Neither stream is acknowledged nor ordered by the network. This crate keeps
//! track of the link state on top of them:
//!
//! ```text
//!                connect()                mark_ready()
//! Disconnected ───────────► Bootstrap ─────────────────► Ready
//!      ▲                        ▲                          │
//!      │ disconnect()           └── navdata in bootstrap ──┘
//!      │                             mode (drone reset)
//!      └──────────────── Error ◄──── any failure to open the link
//! ```
//!
//! Commands are queued in a priority queue and sent by a background task,
//! navdata is read by a second background task and handed to the application
//! through the [NavDataQueue] while the link is [Ready](ConnectionState::Ready).
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use ardrone::ARDrone;
//!
//! let drone = ARDrone::new();
//! drone.connect().await?;
//! drone.trim()?;
//! drone.mark_ready()?;
//!
//! let navdata = drone.navdata().pop().await;
//! println!("Battery: {}%", navdata.battery());
//!
//! drone.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! The video stream and the flight dynamics of the drone are out of scope.

#![deny(missing_docs)]

pub mod command;
mod config;
mod drone;
pub mod link;
pub mod navdata;
mod queue;
mod reader;
mod sender;
mod state;

pub use command::Command;
pub use config::DroneConfig;
pub use drone::ARDrone;
pub use link::UdpTransport;
pub use navdata::NavData;
pub use queue::{CommandQueue, NavDataQueue};
pub use reader::{NavDataReader, ReaderHandle};
pub use sender::CommandSender;
pub use state::ConnectionState;

use std::net::Ipv4Addr;

/// Default address of the drone on its own access point
pub const DEFAULT_DRONE_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
/// UDP port the navdata is received on, both locally and on the drone
pub const NAVDATA_PORT: u16 = 5554;
/// UDP port of the drone AT command interpreter
pub const COMMAND_PORT: u16 = 5559;
/// TCP port of the drone control channel
pub const CONTROL_PORT: u16 = 5559;

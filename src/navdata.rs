//! # Navigation data sent by the drone
//!
//! This module decodes the navdata datagrams streamed by the drone on the
//! navdata port.

use std::fmt::Display;

use anyhow::{Context, bail};

// Navdata datagram structure, all fields little-endian:
// [header, state, sequence, vision, option*]
//
// header (4 bytes): magic number 0x55667788
// state (4 bytes): drone state bitfield
// sequence (4 bytes): navdata sequence number
// vision (4 bytes): vision flag
// option: tag (2 bytes), size (2 bytes, including tag and size), payload
const NAVDATA_HEADER: u32 = 0x5566_7788;
const HEADER_SIZE: usize = 16;
const OPTION_HEADER_SIZE: usize = 4;

const TAG_DEMO: u16 = 0;
const TAG_CHECKSUM: u16 = 0xFFFF;

// Demo option payload:
// ctrl_state u32, vbat u32, theta f32, phi f32, psi f32, altitude i32, vx f32, vy f32, vz f32
const DEMO_PAYLOAD_SIZE: usize = 36;

// Drone state bits
const STATE_FLYING: u32 = 1 << 0;
const STATE_NAVDATA_DEMO: u32 = 1 << 10;
const STATE_NAVDATA_BOOTSTRAP: u32 = 1 << 11;
const STATE_COM_LOST: u32 = 1 << 13;
const STATE_VBAT_LOW: u32 = 1 << 15;
const STATE_CTRL_WATCHDOG: u32 = 1 << 28;
const STATE_COM_WATCHDOG: u32 = 1 << 30;
const STATE_EMERGENCY: u32 = 1 << 31;

/// Navdata mode of the drone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The drone has just (re)started and waits for its navdata configuration
    Bootstrap,
    /// Reduced navdata set
    Demo,
    /// Full navdata set
    Full,
}

/// Content of the demo navdata option
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DemoData {
    /// Control state of the drone state machine
    pub control_state: u32,
    /// Battery level in percent
    pub battery: u32,
    /// Pitch in millidegrees
    pub pitch: f32,
    /// Roll in millidegrees
    pub roll: f32,
    /// Yaw in millidegrees
    pub yaw: f32,
    /// Altitude in millimeters
    pub altitude: i32,
    /// Speed along x in mm/s
    pub vx: f32,
    /// Speed along y in mm/s
    pub vy: f32,
    /// Speed along z in mm/s
    pub vz: f32,
}

impl DemoData {
    fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < DEMO_PAYLOAD_SIZE {
            bail!("Invalid demo option length: expected at least {} bytes, got {}", DEMO_PAYLOAD_SIZE, bytes.len());
        }
        Ok(DemoData {
            control_state: read_u32(bytes, 0),
            battery: read_u32(bytes, 4),
            pitch: f32::from_bits(read_u32(bytes, 8)),
            roll: f32::from_bits(read_u32(bytes, 12)),
            yaw: f32::from_bits(read_u32(bytes, 16)),
            altitude: read_u32(bytes, 20) as i32,
            vx: f32::from_bits(read_u32(bytes, 24)),
            vy: f32::from_bits(read_u32(bytes, 28)),
            vz: f32::from_bits(read_u32(bytes, 32)),
        })
    }
}

/// One navdata datagram
#[derive(Debug, Clone, PartialEq)]
pub struct NavData {
    state: u32,
    sequence: u32,
    vision: u32,
    demo: Option<DemoData>,
}

impl NavData {
    /// Create navdata from a drone state bitfield and a sequence number
    pub fn new(state: u32, sequence: u32) -> Self {
        NavData { state, sequence, vision: 0, demo: None }
    }

    /// Decode a navdata datagram
    ///
    /// Unknown options are skipped. If a checksum option is present, the
    /// datagram is verified against it.
    ///
    /// # Arguments
    ///
    /// * `bytes` - The datagram as received from the drone
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is truncated, does not start with the
    /// navdata header, or fails the checksum
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            bail!("Invalid navdata length: expected at least {} bytes, got {}", HEADER_SIZE, bytes.len());
        }
        let header = read_u32(bytes, 0);
        if header != NAVDATA_HEADER {
            bail!("Invalid navdata header: 0x{:08X}", header);
        }

        let mut navdata = NavData {
            state: read_u32(bytes, 4),
            sequence: read_u32(bytes, 8),
            vision: read_u32(bytes, 12),
            demo: None,
        };

        let mut offset = HEADER_SIZE;
        while offset < bytes.len() {
            if bytes.len() - offset < OPTION_HEADER_SIZE {
                bail!("Truncated navdata option header at offset {}", offset);
            }
            let tag = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
            let size = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            if size < OPTION_HEADER_SIZE || offset + size > bytes.len() {
                bail!("Invalid navdata option 0x{:04X} size {} at offset {}", tag, size, offset);
            }
            let payload = &bytes[offset + OPTION_HEADER_SIZE..offset + size];

            match tag {
                TAG_DEMO => {
                    navdata.demo = Some(DemoData::from_bytes(payload).context("Invalid demo option")?);
                }
                TAG_CHECKSUM => {
                    if payload.len() < 4 {
                        bail!("Invalid navdata checksum option length {}", payload.len());
                    }
                    let expected = read_u32(payload, 0);
                    let actual = checksum(&bytes[..offset]);
                    if expected != actual {
                        bail!("Navdata checksum mismatch: expected 0x{:08X}, got 0x{:08X}", expected, actual);
                    }
                    // The checksum is the last option
                    break;
                }
                _ => {}
            }

            offset += size;
        }

        Ok(navdata)
    }

    /// Navdata mode, derived from the drone state
    pub fn mode(&self) -> Mode {
        if self.state & STATE_NAVDATA_BOOTSTRAP != 0 {
            Mode::Bootstrap
        } else if self.state & STATE_NAVDATA_DEMO != 0 {
            Mode::Demo
        } else {
            Mode::Full
        }
    }

    /// Raw drone state bitfield
    pub fn state(&self) -> u32 {
        self.state
    }

    /// Navdata sequence number
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Vision flag
    pub fn vision(&self) -> u32 {
        self.vision
    }

    /// Demo option, if the datagram carried one
    pub fn demo(&self) -> Option<&DemoData> {
        self.demo.as_ref()
    }

    /// Battery level in percent, 0 if unknown
    pub fn battery(&self) -> u32 {
        self.demo.map(|d| d.battery).unwrap_or(0)
    }

    /// The drone is flying
    pub fn is_flying(&self) -> bool {
        self.state & STATE_FLYING != 0
    }

    /// The drone is in emergency mode
    pub fn is_emergency(&self) -> bool {
        self.state & STATE_EMERGENCY != 0
    }

    /// The battery is too low to fly
    pub fn is_battery_too_low(&self) -> bool {
        self.state & STATE_VBAT_LOW != 0
    }

    /// The drone lost communication with the client
    pub fn is_communication_lost(&self) -> bool {
        self.state & STATE_COM_LOST != 0
    }

    /// The drone control or communication watchdog has fired
    pub fn is_watchdog_triggered(&self) -> bool {
        self.state & (STATE_CTRL_WATCHDOG | STATE_COM_WATCHDOG) != 0
    }
}

impl Display for NavData {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "NavData {{ sequence: {}, mode: {:?}, state: 0x{:08X}", self.sequence, self.mode(), self.state)?;
        if let Some(demo) = &self.demo {
            write!(
                f,
                ", battery: {}%, altitude: {}mm, pitch: {:.1}, roll: {:.1}, yaw: {:.1}",
                demo.battery,
                demo.altitude,
                demo.pitch / 1000.0,
                demo.roll / 1000.0,
                demo.yaw / 1000.0
            )?;
        }
        write!(f, " }}")
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |sum, b| sum.wrapping_add(*b as u32))
}

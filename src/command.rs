//! # AT commands sent to the drone
//!
//! The drone is controlled with text commands of the form
//! `AT*NAME=<sequence>,<arg>,...\r`, one command per UDP datagram. The drone
//! drops any command with a sequence number lower than the last one it
//! executed, the sequence number is therefore assigned by the
//! [CommandSender](crate::CommandSender) at transmission time and not when the
//! command is created.

use std::fmt::Write;

use anyhow::bail;

// AT command names
const AT_CONFIG: &str = "CONFIG";
const AT_FTRIM: &str = "FTRIM";
const AT_REF: &str = "REF";
const AT_PCMD: &str = "PCMD";
const AT_LED: &str = "LED";
const AT_ANIM: &str = "ANIM";
const AT_CTRL: &str = "CTRL";

// AT*REF bits 18, 20, 22, 24 and 28 must always be set
const REF_BASE: u32 = 0x1154_0000;
const REF_TAKEOFF: u32 = 1 << 9;
const REF_EMERGENCY: u32 = 1 << 8;

// AT*PCMD flags
const PCMD_PROGRESSIVE: u32 = 1 << 0;
const PCMD_COMBINED_YAW: u32 = 1 << 1;

/// Control mode acknowledging a configuration write
pub const CTRL_ACK_CONFIG: u32 = 5;

/// Priority of a command in the [CommandQueue](crate::CommandQueue)
///
/// Higher priorities are sent first. Commands of the same priority are sent in
/// the order they were queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Continuous piloting setpoints
    Motion,
    /// Configuration writes, trim and animations
    Configuration,
    /// Take off and landing
    Flight,
    /// Emergency cut-off
    Emergency,
    /// Stop request for the command sender, always first
    Shutdown,
}

/// Command to be sent to the drone
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Write a configuration key
    Configure {
        /// Configuration key, for example `general:navdata_demo`
        key: String,
        /// Value to write
        value: String,
    },
    /// Flat trim, the drone calibrates its horizontal reference. Must be sent
    /// while the drone is on flat ground.
    FlatTrim,
    /// Take off and hover at the default altitude
    TakeOff,
    /// Land
    Land,
    /// Toggle the emergency mode, cuts the motors when flying
    Emergency,
    /// Hold position
    Hover,
    /// Piloting setpoint, all values are in the range [-1.0, 1.0]
    Move {
        /// Left/right tilt
        roll: f32,
        /// Front/back tilt
        pitch: f32,
        /// Vertical speed
        gaz: f32,
        /// Angular speed
        yaw: f32,
        /// Roll also controls the yaw
        combined_yaw: bool,
    },
    /// Play a LED animation
    PlayLed {
        /// Animation number
        animation: u32,
        /// Frequency in Hz
        frequency: f32,
        /// Duration in seconds
        duration: u32,
    },
    /// Play a flight animation
    PlayAnimation {
        /// Animation number
        animation: u32,
        /// Duration in milliseconds
        duration: u32,
    },
    /// Change the control mode, used to acknowledge configuration writes
    Control {
        /// Control mode
        mode: u32,
    },
    /// Stops the command sender, never transmitted
    Quit,
}

impl Command {
    /// Build a configuration write
    pub fn configure(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Configure { key: key.into(), value: value.into() }
    }

    /// Check that the command can be encoded in a single AT frame
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration key or value contains a quote or a
    /// line terminator
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Command::Configure { key, value } = self {
            for text in [key, value] {
                if text.contains(['"', '\r', '\n']) {
                    bail!("Invalid configuration argument {:?}", text);
                }
            }
        }
        Ok(())
    }

    /// Priority of the command in the queue
    pub fn priority(&self) -> Priority {
        match self {
            Command::Hover | Command::Move { .. } => Priority::Motion,
            Command::Configure { .. }
            | Command::FlatTrim
            | Command::PlayLed { .. }
            | Command::PlayAnimation { .. }
            | Command::Control { .. } => Priority::Configuration,
            Command::TakeOff | Command::Land => Priority::Flight,
            Command::Emergency => Priority::Emergency,
            Command::Quit => Priority::Shutdown,
        }
    }

    /// True for the command sender stop request
    pub fn is_quit(&self) -> bool {
        matches!(self, Command::Quit)
    }

    /// Encode the command as an AT command datagram
    ///
    /// # Arguments
    ///
    /// * `sequence` - Sequence number of the command, must be strictly increasing
    ///
    /// # Returns
    ///
    /// The datagram bytes, empty for [Command::Quit]
    pub fn encode(&self, sequence: u32) -> Vec<u8> {
        let (name, args) = match self {
            Command::Configure { key, value } => (AT_CONFIG, format!(",\"{}\",\"{}\"", key, value)),
            Command::FlatTrim => (AT_FTRIM, String::new()),
            Command::TakeOff => (AT_REF, format!(",{}", REF_BASE | REF_TAKEOFF)),
            Command::Land => (AT_REF, format!(",{}", REF_BASE)),
            Command::Emergency => (AT_REF, format!(",{}", REF_BASE | REF_EMERGENCY)),
            Command::Hover => (AT_PCMD, ",0,0,0,0,0".to_string()),
            Command::Move { roll, pitch, gaz, yaw, combined_yaw } => {
                let mut flags = PCMD_PROGRESSIVE;
                if *combined_yaw {
                    flags |= PCMD_COMBINED_YAW;
                }
                let mut args = format!(",{}", flags);
                for value in [roll, pitch, gaz, yaw] {
                    let _ = write!(args, ",{}", float_arg(*value));
                }
                (AT_PCMD, args)
            }
            Command::PlayLed { animation, frequency, duration } => {
                (AT_LED, format!(",{},{},{}", animation, float_arg(*frequency), duration))
            }
            Command::PlayAnimation { animation, duration } => (AT_ANIM, format!(",{},{}", animation, duration)),
            Command::Control { mode } => (AT_CTRL, format!(",{},0", mode)),
            Command::Quit => return Vec::new(),
        };

        format!("AT*{}={}{}\r", name, sequence, args).into_bytes()
    }
}

// Floats are sent as the signed integer sharing their IEEE-754 bits
fn float_arg(value: f32) -> i32 {
    value.to_bits() as i32
}

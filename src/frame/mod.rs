//! Serial frame protocol between host and device.
//!
//! Inbound (host to device) command frame:
//!
//! ```text
//! [magic "FMCM"] [command] [length] [params; length] [checksum]
//! ```
//!
//! Outbound (device to host) frame:
//!
//! ```text
//! [magic "FMPK"] [payload length, u32 LE] [type] [payload] [checksum]
//! ```
//!
//! Both checksums cover every frame byte from the first magic byte up to,
//! but excluding, the checksum byte itself.  See [`crate::checksum`].
//!
//! The device side uses [`FrameParser`] and [`FrameWriter`].  The host side
//! lives in [`crate::client`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod parser;
pub mod writer;

pub use parser::{CommandFrame, FrameParser, ParamBuf};
pub use writer::FrameWriter;

use crate::Error;

/// Magic prefix of host to device frames
pub const INBOUND_MAGIC: [u8; 4] = *b"FMCM";

/// Magic prefix of device to host frames
pub const OUTBOUND_MAGIC: [u8; 4] = *b"FMPK";

/// Parameter lengths must be strictly below this
pub const MAX_PARAM_LENGTH: usize = 16;

/// Bytes before the payload of an outbound frame
pub const OUTBOUND_HEADER_LEN: usize = OUTBOUND_MAGIC.len() + 4 + 1;

/// Fixed part of a value table payload, before the parameter echo
pub const VALUE_TABLE_HEADER_LEN: usize = 10;

/// Block id the measurement parameters are stored under
pub const PARAM_BLOCK_ID: u8 = 0;

/// Commands sent by the host.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reset = b'r',
    Measure = b'm',
    Abort = b'a',
    Intermediate = b'i',
    State = b's',
    ParamsToStore = b'w',
    ParamsFromStore = b'e',
    PersonalityInfo = b'p',
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            b'r' => Ok(Command::Reset),
            b'm' => Ok(Command::Measure),
            b'a' => Ok(Command::Abort),
            b'i' => Ok(Command::Intermediate),
            b's' => Ok(Command::State),
            b'w' => Ok(Command::ParamsToStore),
            b'e' => Ok(Command::ParamsFromStore),
            b'p' => Ok(Command::PersonalityInfo),
            _ => Err(Error::UnknownCommand(value)),
        }
    }
}

/// Kinds of device to host frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Human readable diagnostic text
    Text = b'T',
    /// One byte firmware state
    State = b'S',
    /// Measurement result
    ValueTable = b'V',
    /// Personality descriptor
    PersonalityInfo = b'P',
    /// Raw persisted parameter bytes
    ParamsFromStore = b'E',
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            b'T' => Ok(FrameType::Text),
            b'S' => Ok(FrameType::State),
            b'V' => Ok(FrameType::ValueTable),
            b'P' => Ok(FrameType::PersonalityInfo),
            b'E' => Ok(FrameType::ParamsFromStore),
            _ => Err(Error::UnknownFrameType(value)),
        }
    }
}

/// Firmware state as announced in STATE frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Ready = b'r',
    Measuring = b'm',
    Done = b'd',
    /// Announced immediately before a reset
    Reset = b'R',
}

impl TryFrom<u8> for DeviceState {
    type Error = Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            b'r' => Ok(DeviceState::Ready),
            b'm' => Ok(DeviceState::Measuring),
            b'd' => Ok(DeviceState::Done),
            b'R' => Ok(DeviceState::Reset),
            _ => Err(Error::InvalidFrame),
        }
    }
}

/// Why a value table was sent.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Done = b'D',
    Aborted = b'A',
    Intermediate = b'I',
    Resend = b'R',
}

impl TryFrom<u8> for Reason {
    type Error = Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            b'D' => Ok(Reason::Done),
            b'A' => Ok(Reason::Aborted),
            b'I' => Ok(Reason::Intermediate),
            b'R' => Ok(Reason::Resend),
            _ => Err(Error::InvalidFrame),
        }
    }
}

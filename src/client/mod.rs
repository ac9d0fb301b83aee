//! Host side of the serial protocol:
//! - Encoding command frames for the device, see [`encode_command()`]
//! - Decoding the device's frames from a byte stream, see
//!   [`DeviceFrameDecoder`] and [`DeviceFrame`]
//!
//! This module is `no_std` and allocation free, so it can also run on a
//! second microcontroller acting as the host.  See `AsyncHostClient` (with
//! the `async` feature) for a complete async client.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "async")]
pub use futures::{AsyncHostClient, AsyncTransport};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use heapless::Vec;

use crate::checksum::Checksum;
use crate::frame::{
    Command, DeviceState, FrameType, INBOUND_MAGIC, MAX_PARAM_LENGTH, OUTBOUND_MAGIC, Reason,
    VALUE_TABLE_HEADER_LEN,
};
use crate::personality::PERSONALITY_INFO_HEADER_LEN;
use crate::table::{ElementSize, TableKind};
use crate::{Error, Result};

/// Size of an encoded command frame carrying `params_len` parameter bytes
pub const fn command_frame_len(params_len: usize) -> usize {
    INBOUND_MAGIC.len() + 2 + params_len + 1
}

/// Largest encoded command frame
pub const MAX_COMMAND_FRAME_LEN: usize = command_frame_len(MAX_PARAM_LENGTH - 1);

/// Encode a command frame into `out`, returning the number of bytes used.
///
/// # Errors
///
/// - [`Error::PayloadTooLarge`] if `params` is [`MAX_PARAM_LENGTH`] bytes
///   or longer
/// - [`Error::BufferTooSmall`] if `out` cannot hold the frame
pub fn encode_command(command: Command, params: &[u8], out: &mut [u8]) -> Result<usize> {
    if params.len() >= MAX_PARAM_LENGTH {
        return Err(Error::PayloadTooLarge);
    }
    let len = command_frame_len(params.len());
    if out.len() < len {
        return Err(Error::BufferTooSmall);
    }

    let magic_len = INBOUND_MAGIC.len();
    out[..magic_len].copy_from_slice(&INBOUND_MAGIC);
    out[magic_len] = command as u8;
    out[magic_len + 1] = params.len() as u8;
    out[magic_len + 2..len - 1].copy_from_slice(params);
    out[len - 1] = Checksum::of(&out[..len - 1]);
    Ok(len)
}

/// A complete, checksum-verified device frame holding up to `N` payload
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame<const N: usize> {
    pub frame_type: FrameType,
    pub payload: Vec<u8, N>,
}

impl<const N: usize> RawFrame<N> {
    /// Interpret the payload according to the frame type.
    pub fn parse(&self) -> Result<DeviceFrame<'_>> {
        DeviceFrame::parse(self.frame_type, &self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Magic,
    Length,
    Type,
    Payload,
    Checksum,
}

/// Push-byte decoder for device to host frames.
///
/// A length field larger than `N` is reported as [`Error::PayloadTooLarge`]
/// as soon as it arrives and the decoder goes back to hunting for the magic.
/// A corrupted length therefore costs one frame, not the rest of the stream.
pub struct DeviceFrameDecoder<const N: usize> {
    state: DecoderState,
    index: usize,
    length_bytes: [u8; 4],
    length: usize,
    received: usize,
    frame_type: u8,
    payload: Vec<u8, N>,
    checksum: Checksum,
}

impl<const N: usize> Default for DeviceFrameDecoder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DeviceFrameDecoder<N> {
    pub const fn new() -> Self {
        Self {
            state: DecoderState::Magic,
            index: 0,
            length_bytes: [0; 4],
            length: 0,
            received: 0,
            frame_type: 0,
            payload: Vec::new(),
            checksum: Checksum::new(),
        }
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.state = DecoderState::Magic;
        self.index = 0;
        self.length = 0;
        self.received = 0;
        self.payload.clear();
        self.checksum.reset();
    }

    /// Feed one byte.  Returns a frame once one is complete.
    pub fn push(&mut self, byte: u8) -> Result<Option<RawFrame<N>>> {
        match self.state {
            DecoderState::Magic => {
                if self.index == 0 {
                    self.checksum.reset();
                }
                if byte == OUTBOUND_MAGIC[self.index] {
                    self.checksum.update(byte);
                    self.index += 1;
                    if self.index == OUTBOUND_MAGIC.len() {
                        self.index = 0;
                        self.state = DecoderState::Length;
                    }
                } else if self.index != 0 {
                    self.checksum.reset();
                    self.index = 0;
                    if byte == OUTBOUND_MAGIC[0] {
                        self.checksum.update(byte);
                        self.index = 1;
                    }
                }
                Ok(None)
            }
            DecoderState::Length => {
                self.checksum.update(byte);
                self.length_bytes[self.index] = byte;
                self.index += 1;
                if self.index == self.length_bytes.len() {
                    self.index = 0;
                    let length = u32::from_le_bytes(self.length_bytes) as usize;
                    if length > N {
                        warn!("Device frame of {length} bytes dropped");
                        self.reset();
                        return Err(Error::PayloadTooLarge);
                    }
                    self.length = length;
                    self.state = DecoderState::Type;
                }
                Ok(None)
            }
            DecoderState::Type => {
                self.checksum.update(byte);
                self.frame_type = byte;
                self.received = 0;
                self.payload.clear();
                self.state = if self.length == 0 {
                    DecoderState::Checksum
                } else {
                    DecoderState::Payload
                };
                Ok(None)
            }
            DecoderState::Payload => {
                self.checksum.update(byte);
                if self.payload.push(byte).is_err() {
                    self.reset();
                    return Err(Error::PayloadTooLarge);
                }
                self.received += 1;
                if self.received >= self.length {
                    self.state = DecoderState::Checksum;
                }
                Ok(None)
            }
            DecoderState::Checksum => {
                let matched = self.checksum.matches(byte);
                let result = if !matched {
                    warn!("Device frame checksum mismatch");
                    Err(Error::Checksum)
                } else {
                    FrameType::try_from(self.frame_type).map(|frame_type| {
                        trace!("Received {frame_type:?} frame, {} bytes", self.length);
                        Some(RawFrame {
                            frame_type,
                            payload: core::mem::take(&mut self.payload),
                        })
                    })
                };
                self.reset();
                result
            }
        }
    }
}

/// Decoded VALUE_TABLE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueTable<'a> {
    pub element_size: ElementSize,
    pub reason: Reason,
    pub kind: TableKind,
    /// Timer units elapsed when the table was sent
    pub elapsed: u16,
    /// Requested duration, in timer units
    pub requested: u16,
    /// Echo of the measurement parameters
    pub params: &'a [u8],
    /// Raw table bytes
    pub data: &'a [u8],
}

impl ValueTable<'_> {
    /// Number of complete elements
    pub fn len(&self) -> usize {
        self.data.len() / self.element_size.bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` as an integer.
    pub fn element(&self, index: usize) -> Option<u32> {
        let width = self.element_size.bytes();
        let start = index.checked_mul(width)?;
        let bytes = self.data.get(start..start + width)?;
        let mut le = [0u8; 4];
        le[..width].copy_from_slice(bytes);
        Some(u32::from_le_bytes(le))
    }

    /// Iterate over all complete elements.
    pub fn elements(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len()).filter_map(|i| self.element(i))
    }
}

/// Decoded PERSONALITY_INFO payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonalityInfo<'a> {
    /// Result table size in bytes
    pub table_bytes: u32,
    pub timer_param_size: u8,
    pub skip_param_size: u8,
    pub units_per_second: u8,
    pub element_size: ElementSize,
    pub name: &'a str,
}

impl PersonalityInfo<'_> {
    /// Parameter bytes a MEASURE command needs
    pub fn min_param_size(&self) -> usize {
        self.timer_param_size as usize + self.skip_param_size as usize
    }
}

/// A device frame with its payload decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFrame<'a> {
    Text(&'a str),
    State(DeviceState),
    ValueTable(ValueTable<'a>),
    PersonalityInfo(PersonalityInfo<'a>),
    StoredParams(&'a [u8]),
}

impl<'a> DeviceFrame<'a> {
    /// Decode `payload` as a frame of type `frame_type`.
    pub fn parse(frame_type: FrameType, payload: &'a [u8]) -> Result<Self> {
        match frame_type {
            FrameType::Text => core::str::from_utf8(payload)
                .map(DeviceFrame::Text)
                .map_err(|_| Error::InvalidFrame),
            FrameType::State => match payload {
                [state] => Ok(DeviceFrame::State(DeviceState::try_from(*state)?)),
                _ => Err(Error::InvalidFrame),
            },
            FrameType::ValueTable => parse_value_table(payload).map(DeviceFrame::ValueTable),
            FrameType::PersonalityInfo => {
                parse_personality_info(payload).map(DeviceFrame::PersonalityInfo)
            }
            FrameType::ParamsFromStore => Ok(DeviceFrame::StoredParams(payload)),
        }
    }
}

fn parse_value_table(payload: &[u8]) -> Result<ValueTable<'_>> {
    if payload.len() < VALUE_TABLE_HEADER_LEN {
        return Err(Error::InvalidFrame);
    }
    let (header, rest) = payload.split_at(VALUE_TABLE_HEADER_LEN);
    let param_len = header[3] as usize;
    if rest.len() < param_len {
        return Err(Error::InvalidFrame);
    }
    let (params, data) = rest.split_at(param_len);

    Ok(ValueTable {
        element_size: ElementSize::try_from(header[0])?,
        reason: Reason::try_from(header[1])?,
        kind: TableKind::try_from(header[2])?,
        elapsed: u16::from_le_bytes([header[4], header[5]]),
        requested: u16::from_le_bytes([header[6], header[7]]),
        params,
        data,
    })
}

fn parse_personality_info(payload: &[u8]) -> Result<PersonalityInfo<'_>> {
    if payload.len() < PERSONALITY_INFO_HEADER_LEN {
        return Err(Error::InvalidFrame);
    }
    let (header, name) = payload.split_at(PERSONALITY_INFO_HEADER_LEN);
    Ok(PersonalityInfo {
        table_bytes: u32::from_le_bytes([header[0], header[1], header[2], header[3]]),
        timer_param_size: header[4],
        skip_param_size: header[5],
        units_per_second: header[6],
        element_size: ElementSize::try_from(header[7])?,
        name: core::str::from_utf8(name).map_err(|_| Error::InvalidFrame)?,
    })
}

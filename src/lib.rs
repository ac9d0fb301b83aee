//! Core of a multichannel analyzer (MCA) / time-series logger firmware.
//!
//! The device samples an ADC (or counts events), accumulates the results into
//! an in-memory table and exchanges framed, checksummed commands and results
//! with a host over a serial link.  This crate contains everything above the
//! peripheral layer:
//!
//! - the serial frame protocol and its rolling checksum,
//! - the firmware state machine (READY / MEASURING / DONE, plus reset),
//! - a log-structured EEPROM emulation on top of sector-erasable flash
//!   ("eepflash"), used to persist measurement parameters,
//! - the interrupt-side acquisition callbacks and the shared device context
//!   they hand results over through.
//!
//! `no_std`.  Requires `alloc` only for the optional host-side async client.
//!
//! ## Architecture
//!
//! The crate never touches hardware directly.  Each external collaborator is a
//! trait in [`io`]:
//!
//! - [`io::ByteTransport`] - the UART, byte at a time
//! - [`io::FlashDevice`] - sector erase and 16-bit word programming
//! - [`io::SamplingSource`] - the ADC/timer machinery, started and stopped by
//!   the firmware
//! - [`io::ResetControl`] - the watchdog or software reset
//!
//! Data flows as follows:
//!
//! ```text
//! ByteTransport -> frame::FrameParser -> firmware::Firmware -> SamplingSource
//!                                             |                    |
//!                                             |       (ISR) acquisition::DeviceContext
//!                                             |                    |
//! ByteTransport <- frame::FrameWriter <-------+---- table::ResultTable
//!
//! firmware::Firmware <-> store::EepFlash <-> FlashDevice
//! ```
//!
//! There are two lanes of control.  The main loop runs the parser and the
//! firmware state machine.  The sampling source's interrupt handler calls
//! [`acquisition::DeviceContext::on_sample()`] and
//! [`acquisition::DeviceContext::on_tick()`], which fill the result table
//! and raise the "measurement finished" flag.  The rules for who may write
//! which field of the context are documented on
//! [`acquisition::DeviceContext`].
//!
//! ## Modules
//!
//! - [`checksum`] - rolling checksum shared by both directions of the link
//! - [`frame`] - inbound command parser and outbound frame writer
//! - [`firmware`] - the firmware state machine
//! - [`store`] - flash-backed parameter store, plus a RAM flash simulator
//! - [`table`] - the result table and its element codec
//! - [`acquisition`] - device context and interrupt callbacks
//! - [`personality`] - build-time device variants and parameter decoding
//! - [`client`] - host-side command encoder and device frame decoder
//! - [`io`] - traits for the external collaborators
//!
//! ## Getting Started
//!
//! **Target setup**:
//! 1. Implement [`io::ByteTransport`] for the UART, [`io::FlashDevice`] for
//!    the flash controller, [`io::SamplingSource`] for the ADC/timer setup and
//!    [`io::ResetControl`] for the reset mechanism.
//! 2. Place an [`acquisition::DeviceContext`] in a `static`, and call its
//!    `on_sample()`/`on_tick()` from the ADC and timer interrupt handlers.
//! 3. Open the parameter store with [`store::EepFlash::init()`], passing the
//!    two flash sections reserved for it.
//! 4. Create a [`firmware::Firmware`], call [`firmware::Firmware::boot()`]
//!    and then [`firmware::Firmware::poll()`] forever.  When `poll()` returns
//!    [`firmware::Poll::Reset`] the reset has been requested.
//!
//! **Host setup**:
//! 1. Encode commands with [`client::encode_command()`].
//! 2. Feed received bytes into a [`client::DeviceFrameDecoder`], or use
//!    `client::AsyncHostClient` with an async transport.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable the async host client (requires `alloc`).
//!
//! Compile with `--no-default-features` for the device.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "async")]
extern crate alloc;

pub mod acquisition;
pub mod checksum;
pub mod client;
pub mod firmware;
pub mod frame;
pub mod io;
pub mod personality;
pub mod store;
pub mod table;

#[cfg(test)]
pub(crate) mod testutil;

/// Firmware errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// No data available
    NoData,
    /// Transport or peripheral I/O error
    Io,
    /// Buffer too small for operation
    BufferTooSmall,
    /// Payload too large for the frame or store
    PayloadTooLarge,
    /// Address or length not aligned to the flash word size
    NotAligned,
    /// Address outside of the device or section
    OutOfBounds,
    /// Flash sections overlap, differ in size or are not sector aligned
    InvalidLayout,
    /// Flash controller reported a failed sector erase
    FlashErase,
    /// Flash controller reported a failed word write
    FlashWrite,
    /// Block does not fit in a section even after compaction
    StoreExhausted,
    /// Block id outside of the configured range
    UnknownBlock,
    /// Measurement parameters rejected by the personality
    InvalidParams,
    /// Command code not recognised
    UnknownCommand(u8),
    /// Frame type not recognised
    UnknownFrameType(u8),
    /// Frame malformed (bad magic, length or header)
    InvalidFrame,
    /// Frame checksum mismatch
    Checksum,
}

/// Type to represent the result of a firmware operation
pub type Result<T> = core::result::Result<T, Error>;

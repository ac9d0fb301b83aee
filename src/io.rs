//! Traits for the firmware's external collaborators.
//!
//! The core never touches peripheral registers.  The board support code
//! implements these traits for the real UART, flash controller, ADC/timer and
//! reset logic, while tests and host-side simulations use in-memory versions
//! (see [`crate::store::RamFlash`]).
//!
//! # Address Space
//!
//! [`FlashDevice`] methods use absolute addresses as they appear in the
//! device's memory map.  The implementation is responsible for translating
//! them to whatever internal representation it uses (controller page/offset
//! registers, array indices, etc.).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ops::Range;

use crate::Result;
use crate::personality::MeasureConfig;

/// Reliable, ordered byte channel to the host, typically a UART.
pub trait ByteTransport {
    /// Read the next byte, blocking until one has arrived.
    fn get_byte(&mut self) -> Result<u8>;

    /// Write a byte, blocking until the transmitter can accept it.
    fn put_byte(&mut self, byte: u8) -> Result<()>;

    /// Non-blocking check whether [`Self::get_byte()`] would return
    /// immediately.
    fn byte_available(&mut self) -> bool;

    /// Write a block of bytes.
    ///
    /// Implementations with a FIFO or DMA may override this.
    fn put_block(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            self.put_byte(b)?;
        }
        Ok(())
    }
}

/// Flash memory which can only be erased a sector at a time and programmed
/// in 16-bit words.
///
/// Programming can only clear bits.  A word must have been erased (all ones)
/// since it was last written before it can be written again.
pub trait FlashDevice {
    /// Size of an erase sector in bytes.  Must be a power of two.
    fn sector_size(&self) -> u32;

    /// Read bytes starting at the absolute address `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range lies outside the device.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Erase the sectors numbered `sectors`, setting every byte to `0xFF`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FlashErase`] if the controller reports a
    /// failure.  The implementation must stop at the first failing sector
    /// and not retry indefinitely.
    fn erase(&mut self, sectors: Range<u32>) -> Result<()>;

    /// Program the 16-bit little endian `word` at the even address `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotAligned`] for an odd address and
    /// [`crate::Error::FlashWrite`] if the controller reports a failure.
    fn write_word(&mut self, addr: u32, word: u16) -> Result<()>;
}

/// The ADC/timer machinery which produces samples or events.
///
/// Once started, the source's interrupt handlers call
/// [`crate::acquisition::DeviceContext::on_sample()`] and
/// [`crate::acquisition::DeviceContext::on_tick()`].
pub trait SamplingSource {
    /// Configure and enable the triggering interrupts.
    fn start(&mut self, config: &MeasureConfig);

    /// Disable the triggering interrupts.  No callback may run after this
    /// returns.
    fn stop(&mut self);
}

/// Device reset.
pub trait ResetControl {
    /// Trigger a full device reset.
    ///
    /// On hardware this does not return.  Simulations record the request and
    /// return, after which the firmware processes no further input.
    fn soft_reset(&mut self);
}

//! RAM backed [`FlashDevice`] for tests and host-side simulation.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use core::ops::Range;

use crate::io::FlashDevice;
use crate::{Error, Result};

/// Value of an erased flash byte
pub const ERASED: u8 = 0xFF;

/// Simulated NOR flash of `SIZE` bytes mapped at `base`.
///
/// Programming can only clear bits.  An attempt to set a bit fails with
/// [`Error::FlashWrite`], which catches a store writing a word twice.
///
/// Faults can be injected to simulate power loss: after
/// [`Self::fail_after_writes()`] the given number of words succeed and every
/// further write fails without touching the array.
pub struct RamFlash<const SIZE: usize> {
    mem: [u8; SIZE],
    base: u32,
    sector_size: u32,
    writes_left: Option<usize>,
    fail_erase: bool,
    writes: usize,
    erases: usize,
}

impl<const SIZE: usize> RamFlash<SIZE> {
    /// Create an erased device.  `sector_size` must be a power of two which
    /// divides `SIZE`.
    pub const fn new(base: u32, sector_size: u32) -> Self {
        Self {
            mem: [ERASED; SIZE],
            base,
            sector_size,
            writes_left: None,
            fail_erase: false,
            writes: 0,
            erases: 0,
        }
    }

    /// Let `count` more word writes succeed, then fail the rest.
    pub fn fail_after_writes(&mut self, count: usize) {
        self.writes_left = Some(count);
    }

    /// Make every sector erase fail.
    pub fn fail_erases(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    /// Remove injected faults, as after a power cycle.
    pub fn clear_faults(&mut self) {
        self.writes_left = None;
        self.fail_erase = false;
    }

    /// Number of successful word writes
    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Number of successful sector erases
    pub fn erase_count(&self) -> usize {
        self.erases
    }

    /// Raw view of the array
    pub fn contents(&self) -> &[u8] {
        &self.mem
    }

    /// Overwrite bytes directly, bypassing NOR semantics.  Used to build
    /// corrupt images.
    pub fn poke(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let range = self.offsets(addr, bytes.len())?;
        self.mem[range].copy_from_slice(bytes);
        Ok(())
    }

    fn offsets(&self, addr: u32, len: usize) -> Result<Range<usize>> {
        let start = addr.checked_sub(self.base).ok_or(Error::OutOfBounds)? as usize;
        let end = start.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > SIZE {
            return Err(Error::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl<const SIZE: usize> FlashDevice for RamFlash<SIZE> {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.offsets(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn erase(&mut self, sectors: Range<u32>) -> Result<()> {
        for sector in sectors {
            if self.fail_erase {
                error!("Erase of sector {sector} failed");
                return Err(Error::FlashErase);
            }
            let addr = sector
                .checked_mul(self.sector_size)
                .ok_or(Error::OutOfBounds)?;
            let range = self.offsets(addr, self.sector_size as usize)?;
            self.mem[range].fill(ERASED);
            self.erases += 1;
        }
        Ok(())
    }

    fn write_word(&mut self, addr: u32, word: u16) -> Result<()> {
        if addr % 2 != 0 {
            return Err(Error::NotAligned);
        }
        let range = self.offsets(addr, 2)?;

        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(Error::FlashWrite);
            }
            *left -= 1;
        }

        let new = word.to_le_bytes();
        let cells = &mut self.mem[range];
        for (cell, &b) in cells.iter().zip(new.iter()) {
            if *cell & b != b {
                warn!("Write of {word:#06x} to {addr:#010X} needs an erase");
                return Err(Error::FlashWrite);
            }
        }
        cells.copy_from_slice(&new);
        self.writes += 1;
        Ok(())
    }
}

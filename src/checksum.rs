//! Rolling checksum used by the serial frame protocol.
//!
//! The device keeps two independent accumulators, one for the inbound byte
//! stream and one for the outbound stream.  Both sides of the link fold every
//! frame byte (magic included) into the accumulator and compare one checksum
//! byte at the end of the frame.
//!
//! This is link glue, not cryptography: the only hard requirement is that two
//! accumulators fed the same byte sequence agree.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Seed value for a fresh accumulator
const CHECKSUM_SEED: u16 = 0x3e59;

/// Rotate-XOR checksum accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    accu: u16,
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum {
    /// Create a freshly reset accumulator.
    pub const fn new() -> Self {
        Self {
            accu: CHECKSUM_SEED,
        }
    }

    /// Reset to the seed value, ready for a new frame.
    pub fn reset(&mut self) {
        self.accu = CHECKSUM_SEED;
    }

    /// Fold one byte into the accumulator.
    #[inline]
    pub fn update(&mut self, byte: u8) {
        let x = (byte as u16).wrapping_mul(11);
        self.accu = self.accu.rotate_left(3) ^ x;
    }

    /// Fold a slice of bytes into the accumulator.
    pub fn update_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.update(b);
        }
    }

    /// The checksum byte to put on the wire.
    ///
    /// Both halves of the accumulator are folded together so bits that have
    /// rotated into the high byte still take part in the comparison.
    pub const fn extract(&self) -> u8 {
        ((self.accu ^ (self.accu >> 8)) & 0xff) as u8
    }

    /// Whether a received checksum byte matches what we accumulated.
    pub const fn matches(&self, byte: u8) -> bool {
        self.extract() == byte
    }

    /// One-shot checksum of a complete byte sequence.
    pub fn of(bytes: &[u8]) -> u8 {
        let mut cs = Self::new();
        cs.update_slice(bytes);
        cs.extract()
    }
}

//! Result table filled by the acquisition interrupt and sent to the host.
//!
//! The table is a fixed block of bytes interpreted as little endian elements
//! of 1, 2, 3 or 4 bytes.  Depending on the [`TableKind`] it holds a
//! histogram (one counter per ADC value), a time series (one event counter
//! per time slot) or raw samples.
//!
//! Every byte is an [`AtomicU8`], so the interrupt lane may write elements
//! while the main loop streams the table out for an intermediate result
//! without any undefined behaviour.  Such a read may observe a multi-byte
//! element half updated.  That glitch is accepted for intermediate results;
//! final results are only read after the sampling source has been stopped.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Width of one table element.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSize {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl ElementSize {
    /// Element width in bytes
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Element width in bits
    pub const fn bits(self) -> u8 {
        (self as u8) * 8
    }
}

impl TryFrom<u8> for ElementSize {
    type Error = crate::Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            1 => Ok(ElementSize::One),
            2 => Ok(ElementSize::Two),
            3 => Ok(ElementSize::Three),
            4 => Ok(ElementSize::Four),
            _ => Err(crate::Error::InvalidFrame),
        }
    }
}

/// What the table's elements mean.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// One counter per (scaled) ADC value
    Histogram = b'H',
    /// One event counter per time slot
    TimeSeries = b'T',
    /// One element per kept ADC sample
    Samples = b'S',
}

impl TryFrom<u8> for TableKind {
    type Error = crate::Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            b'H' => Ok(TableKind::Histogram),
            b'T' => Ok(TableKind::TimeSeries),
            b'S' => Ok(TableKind::Samples),
            _ => Err(crate::Error::InvalidFrame),
        }
    }
}

/// Unsigned 24 bit integer, stored as three little endian bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Uint24([u8; 3]);

impl Uint24 {
    pub const MAX: u32 = 0x00ff_ffff;

    pub const fn from_le_bytes(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    pub const fn to_le_bytes(self) -> [u8; 3] {
        self.0
    }

    /// Truncates `value` to its low 24 bits.
    pub const fn from_u32(value: u32) -> Self {
        let b = value.to_le_bytes();
        Self([b[0], b[1], b[2]])
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0])
    }

    /// Increment by one, wrapping from [`Self::MAX`] to zero.
    pub fn increment(&mut self) {
        for b in self.0.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }

    /// Compare against the low 24 bits of `value`.
    pub const fn eq_u32(self, value: u32) -> bool {
        self.to_u32() == (value & Self::MAX)
    }
}

/// Fixed capacity result table of `N` bytes.
pub struct ResultTable<const N: usize> {
    bytes: [AtomicU8; N],
    element_size: ElementSize,
    kind: TableKind,
    /// Element index the interrupt lane writes next
    cursor: AtomicUsize,
    /// Number of bytes holding valid data
    size: AtomicUsize,
}

impl<const N: usize> ResultTable<N> {
    /// Create a zeroed table.  `const` so it can live in a `static`.
    pub const fn new(element_size: ElementSize, kind: TableKind) -> Self {
        Self {
            bytes: [const { AtomicU8::new(0) }; N],
            element_size,
            kind,
            cursor: AtomicUsize::new(0),
            size: AtomicUsize::new(Self::initial_size(element_size, kind)),
        }
    }

    const fn initial_size(element_size: ElementSize, kind: TableKind) -> usize {
        match kind {
            TableKind::Histogram => (N / element_size.bytes()) * element_size.bytes(),
            TableKind::TimeSeries => {
                if N >= element_size.bytes() {
                    element_size.bytes()
                } else {
                    0
                }
            }
            TableKind::Samples => 0,
        }
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Number of whole elements the table can hold
    pub const fn capacity(&self) -> usize {
        N / self.element_size.bytes()
    }

    /// Number of bytes holding valid data
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Element index the interrupt lane writes next
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Zero the table and rewind the cursor.
    ///
    /// Main loop only, while the sampling source is stopped.
    pub fn clear(&self) {
        for b in self.bytes.iter() {
            b.store(0, Ordering::Relaxed);
        }
        self.cursor.store(0, Ordering::Relaxed);
        self.size.store(
            Self::initial_size(self.element_size, self.kind),
            Ordering::Release,
        );
    }

    /// Read element `index`, or `None` if out of range.
    pub fn element(&self, index: usize) -> Option<u32> {
        if index >= self.capacity() {
            return None;
        }
        let start = index * self.element_size.bytes();
        let mut le = [0u8; 4];
        for (i, b) in le.iter_mut().take(self.element_size.bytes()).enumerate() {
            *b = self.bytes[start + i].load(Ordering::Relaxed);
        }
        Some(u32::from_le_bytes(le))
    }

    /// Iterate over the valid bytes of the table, in wire order.
    pub fn filled_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.leading_bytes(self.size_bytes())
    }

    /// Iterate over the first `len` bytes of the table.  Used to stream a
    /// table whose size was sampled beforehand while it may still grow.
    pub fn leading_bytes(&self, len: usize) -> impl Iterator<Item = u8> + '_ {
        self.bytes[..len.min(N)]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
    }

    // Interrupt lane operations below.  Only the acquisition callbacks call
    // these, and only while the sampling source is running.

    /// Store `value`, truncated to the element width, at `index`.
    pub(crate) fn set_element(&self, index: usize, value: u32) -> bool {
        if index >= self.capacity() {
            return false;
        }
        let start = index * self.element_size.bytes();
        let le = value.to_le_bytes();
        for (i, &b) in le.iter().take(self.element_size.bytes()).enumerate() {
            self.bytes[start + i].store(b, Ordering::Relaxed);
        }
        true
    }

    /// Increment element `index`, wrapping at the element width.
    pub(crate) fn increment_element(&self, index: usize) -> bool {
        let Some(current) = self.element(index) else {
            return false;
        };
        let next = match self.element_size {
            ElementSize::One => (current as u8).wrapping_add(1) as u32,
            ElementSize::Two => (current as u16).wrapping_add(1) as u32,
            ElementSize::Three => {
                let mut v = Uint24::from_u32(current);
                v.increment();
                v.to_u32()
            }
            ElementSize::Four => current.wrapping_add(1),
        };
        self.set_element(index, next)
    }

    /// Increment the element under the cursor.
    pub(crate) fn increment_current(&self) -> bool {
        self.increment_element(self.cursor.load(Ordering::Relaxed))
    }

    /// Append `value` at the cursor.  Returns `false` once the table is full.
    pub(crate) fn append(&self, value: u32) -> bool {
        let cursor = self.cursor.load(Ordering::Relaxed);
        if !self.set_element(cursor, value) {
            return false;
        }
        self.cursor.store(cursor + 1, Ordering::Relaxed);
        self.size.store(
            (cursor + 1) * self.element_size.bytes(),
            Ordering::Release,
        );
        true
    }

    /// Move the cursor to the next element, which then counts as filled.
    /// Returns `false` if there is no next element.
    pub(crate) fn advance(&self) -> bool {
        let next = self.cursor.load(Ordering::Relaxed) + 1;
        if next >= self.capacity() {
            return false;
        }
        self.cursor.store(next, Ordering::Relaxed);
        self.size.store(
            (next + 1) * self.element_size.bytes(),
            Ordering::Release,
        );
        true
    }

    /// Whether every element has been written (samples) or reached (time
    /// series).
    pub fn is_full(&self) -> bool {
        match self.kind {
            TableKind::Histogram => false,
            TableKind::TimeSeries => self.cursor() + 1 >= self.capacity(),
            TableKind::Samples => self.cursor() >= self.capacity(),
        }
    }
}

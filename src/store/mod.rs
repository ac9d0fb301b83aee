//! Log-structured key/value store on sector-erasable flash ("eepflash").
//!
//! Emulates a small EEPROM holding up to `BLOCKS` variable length blocks,
//! addressed by block id, on top of two equally sized flash sections.  One
//! section is *active* and holds an append-only log of records:
//!
//! ```text
//! +----------+--------+-----------+---------------------------+
//! | block_id | marker | data_size | payload, padded to even   |
//! |    u8    |  0xAA  |  u16 LE   | data_size bytes (+1 pad)  |
//! +----------+--------+-----------+---------------------------+
//! ```
//!
//! The log ends at the first record whose marker is not [`VALID_MARKER`].
//! Writing a block appends a new record and the latest record for an id
//! wins.  When the active section is full, every live block except the one
//! being written is copied to the other (*alternate*) section, the old
//! section is erased and the roles swap.
//!
//! # Power loss
//!
//! The id/marker word of a record is programmed last, so a record
//! interrupted mid-write has no valid marker and is invisible.  During
//! compaction the marker of the first copied record is held back until all
//! records have been copied, so the alternate section only becomes
//! recognisable as active once it is complete.  If power is lost after that
//! point but before the old section is erased, both sections start with a
//! valid record and section 2 wins.  Either section then holds every live
//! block as it was before the interrupted write.
//!
//! Partly written garbage after the end of the log is detected during the
//! scan and forces a compaction before the next append.
//!
//! The store is not reentrant.  Only the main loop uses it.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub mod ram;

pub use ram::RamFlash;

use core::ops::Range;

use crate::io::FlashDevice;
use crate::{Error, Result};

/// Marker byte identifying a completely written record
pub const VALID_MARKER: u8 = 0xAA;

/// Size of a record header in bytes
pub const HEADER_SIZE: u32 = 4;

/// Value of a data size word that was never programmed
const UNWRITTEN_SIZE: u16 = 0xFFFF;

/// Chunk size used when copying and blank checking.  Must be even.
const COPY_CHUNK: usize = 32;

/// Round `len` up to the flash word size.
pub const fn align(len: usize) -> usize {
    len + (len & 1)
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_id: u8,
    pub marker: u8,
    pub data_size: u16,
}

impl BlockHeader {
    pub const fn new(block_id: u8, data_size: u16) -> Self {
        Self {
            block_id,
            marker: VALID_MARKER,
            data_size,
        }
    }

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            block_id: bytes[0],
            marker: bytes[1],
            data_size: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.marker == VALID_MARKER && self.data_size != UNWRITTEN_SIZE
    }

    /// Whether all four header bytes still read as erased
    pub const fn is_erased(&self) -> bool {
        self.block_id == 0xFF && self.marker == 0xFF && self.data_size == UNWRITTEN_SIZE
    }

    /// First word of the record, programmed last
    pub const fn id_word(&self) -> u16 {
        u16::from_le_bytes([self.block_id, self.marker])
    }

    /// Bytes the whole record occupies
    pub const fn footprint(&self) -> u32 {
        HEADER_SIZE + align(self.data_size as usize) as u32
    }
}

/// Addresses of the two flash sections used by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub section1: Range<u32>,
    pub section2: Range<u32>,
}

impl StoreLayout {
    fn check(&self, sector_size: u32) -> Result<()> {
        let (s1, s2) = (&self.section1, &self.section2);
        if sector_size == 0
            || !sector_size.is_power_of_two()
            || s1.is_empty()
            || s1.len() != s2.len()
            || s1.len() < HEADER_SIZE as usize
        {
            return Err(Error::InvalidLayout);
        }
        for addr in [s1.start, s1.end, s2.start, s2.end] {
            if addr % sector_size != 0 {
                return Err(Error::InvalidLayout);
            }
        }
        if s1.start < s2.end && s2.start < s1.end {
            return Err(Error::InvalidLayout);
        }
        Ok(())
    }
}

/// The flash store.
///
/// `BLOCKS` is the number of block ids, `0..BLOCKS`.
pub struct EepFlash<F: FlashDevice, const BLOCKS: usize> {
    flash: F,
    active: Range<u32>,
    alternate: Range<u32>,
    index: [Option<u32>; BLOCKS],
    queue_end: u32,
    needs_compaction: bool,
}

impl<F: FlashDevice, const BLOCKS: usize> EepFlash<F, BLOCKS> {
    /// Take ownership of `flash`, choose the active section and build the
    /// block index.  Runs once at boot.
    ///
    /// Section 2 is active if it starts with a valid record, otherwise
    /// section 1.
    pub fn init(mut flash: F, layout: StoreLayout) -> Result<Self> {
        layout.check(flash.sector_size())?;
        if BLOCKS > u8::MAX as usize {
            return Err(Error::InvalidLayout);
        }

        let second = read_header(&mut flash, layout.section2.start)?;
        let (active, alternate) = if second.is_valid() {
            (layout.section2, layout.section1)
        } else {
            (layout.section1, layout.section2)
        };
        debug!(
            "Store active section {:#010X}-{:#010X}",
            active.start, active.end
        );

        let mut store = Self {
            flash,
            queue_end: active.start,
            active,
            alternate,
            index: [None; BLOCKS],
            needs_compaction: false,
        };
        store.scan()?;
        Ok(store)
    }

    /// Read the latest payload of `block_id` into `buf`.
    ///
    /// Returns the payload length, or `None` if the block was never written.
    pub fn read(&mut self, block_id: u8, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(addr) = self.lookup(block_id)? else {
            return Ok(None);
        };
        let header = read_header(&mut self.flash, addr)?;
        let len = header.data_size as usize;
        if len > buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.flash.read(addr + HEADER_SIZE, &mut buf[..len])?;
        Ok(Some(len))
    }

    /// Length of the latest payload of `block_id`, if any.
    pub fn block_len(&mut self, block_id: u8) -> Result<Option<usize>> {
        match self.lookup(block_id)? {
            Some(addr) => Ok(Some(read_header(&mut self.flash, addr)?.data_size as usize)),
            None => Ok(None),
        }
    }

    /// Store `data` as the new content of `block_id`.
    ///
    /// Compacts the store first if the record does not fit.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreExhausted`] if the record does not fit even after
    ///   compaction.
    /// - [`Error::FlashErase`]/[`Error::FlashWrite`] on hardware failure.
    ///   The previous content of the block stays readable.
    pub fn write(&mut self, block_id: u8, data: &[u8]) -> Result<()> {
        self.lookup(block_id)?;
        if data.len() >= UNWRITTEN_SIZE as usize {
            return Err(Error::PayloadTooLarge);
        }

        let header = BlockHeader::new(block_id, data.len() as u16);
        let footprint = header.footprint();
        if footprint as usize > self.active.len() {
            error!("Block {block_id} of {} bytes can never fit", data.len());
            return Err(Error::StoreExhausted);
        }

        if self.needs_compaction || self.queue_end + footprint > self.active.end {
            let needed = self.live_footprint(block_id)? + footprint;
            if needed as usize > self.active.len() {
                error!("Store exhausted writing block {block_id}, {needed} bytes needed");
                return Err(Error::StoreExhausted);
            }
            self.compact(block_id)?;
            if self.queue_end + footprint > self.active.end {
                error!("Store exhausted writing block {block_id}");
                return Err(Error::StoreExhausted);
            }
        }

        let addr = self.queue_end;
        trace!("Writing block {block_id} at {addr:#010X}");
        if let Err(e) = self.program_record(addr, header, data, true) {
            error!("Flash write of block {block_id} failed: {e:?}");
            // Whatever made it to flash is garbage now
            self.needs_compaction = true;
            return Err(e);
        }

        self.index[block_id as usize] = Some(addr);
        self.queue_end = addr + footprint;
        Ok(())
    }

    /// Bytes left in the active section
    pub fn free_space(&self) -> u32 {
        self.active.end - self.queue_end
    }

    /// Address range of the active section
    pub fn active_section(&self) -> Range<u32> {
        self.active.clone()
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Release the flash device.
    pub fn into_flash(self) -> F {
        self.flash
    }
}

// Internal functions
impl<F: FlashDevice, const BLOCKS: usize> EepFlash<F, BLOCKS> {
    fn lookup(&self, block_id: u8) -> Result<Option<u32>> {
        self.index
            .get(block_id as usize)
            .copied()
            .ok_or(Error::UnknownBlock)
    }

    /// Bytes the live blocks other than `except` occupy.
    fn live_footprint(&mut self, except: u8) -> Result<u32> {
        let mut total = 0;
        for id in 0..BLOCKS {
            if id == except as usize {
                continue;
            }
            if let Some(addr) = self.index[id] {
                total += read_header(&mut self.flash, addr)?.footprint();
            }
        }
        Ok(total)
    }

    /// Rebuild the index from the active section.
    fn scan(&mut self) -> Result<()> {
        self.index = [None; BLOCKS];
        self.needs_compaction = false;

        let mut addr = self.active.start;
        while addr + HEADER_SIZE <= self.active.end {
            let header = read_header(&mut self.flash, addr)?;
            if !header.is_valid() {
                if !header.is_erased() {
                    warn!("Corrupt record header at {addr:#010X}: {header:?}");
                    self.needs_compaction = true;
                }
                break;
            }

            let next = addr + header.footprint();
            if next > self.active.end {
                warn!("Record at {addr:#010X} overruns the section");
                self.needs_compaction = true;
                break;
            }

            match self.index.get_mut(header.block_id as usize) {
                Some(slot) => *slot = Some(addr),
                None => warn!("Skipping unknown block {} at {addr:#010X}", header.block_id),
            }
            addr = next;
        }

        self.queue_end = addr;
        debug!(
            "Store scanned, {} bytes used",
            self.queue_end - self.active.start
        );
        Ok(())
    }

    /// Copy every live block except `expunge` to the alternate section and
    /// make it the active one.
    fn compact(&mut self, expunge: u8) -> Result<()> {
        debug!("Compacting store, dropping block {expunge}");

        if !self.is_blank(self.alternate.clone())? {
            self.erase_section(self.alternate.clone())?;
        }

        let mut dst = self.alternate.start;
        let mut held_back: Option<(u32, BlockHeader)> = None;
        for id in 0..BLOCKS {
            if id == expunge as usize {
                continue;
            }
            let Some(src) = self.index[id] else {
                continue;
            };

            let header = read_header(&mut self.flash, src)?;
            self.copy_record(src, dst, header, held_back.is_some())?;
            if held_back.is_none() {
                held_back = Some((dst, header));
            }
            dst += header.footprint();
        }

        if let Some((addr, header)) = held_back {
            self.flash.write_word(addr, header.id_word())?;
        }

        self.erase_section(self.active.clone())?;
        core::mem::swap(&mut self.active, &mut self.alternate);
        debug!(
            "Store swapped to section {:#010X}-{:#010X}",
            self.active.start, self.active.end
        );
        self.scan()
    }

    /// Program a record from RAM.  The id/marker word goes last, and only
    /// if `mark` is set.
    fn program_record(
        &mut self,
        addr: u32,
        header: BlockHeader,
        data: &[u8],
        mark: bool,
    ) -> Result<()> {
        self.flash.write_word(addr + 2, header.data_size)?;
        self.program(addr + HEADER_SIZE, data)?;
        if mark {
            self.flash.write_word(addr, header.id_word())?;
        }
        Ok(())
    }

    /// Copy a record within flash, chunk by chunk.
    fn copy_record(&mut self, src: u32, dst: u32, header: BlockHeader, mark: bool) -> Result<()> {
        self.flash.write_word(dst + 2, header.data_size)?;

        let mut buf = [0u8; COPY_CHUNK];
        let len = header.data_size as usize;
        let mut done = 0;
        while done < len {
            let n = (len - done).min(COPY_CHUNK);
            let ofs = HEADER_SIZE + done as u32;
            self.flash.read(src + ofs, &mut buf[..n])?;
            self.program(dst + ofs, &buf[..n])?;
            done += n;
        }

        if mark {
            self.flash.write_word(dst, header.id_word())?;
        }
        Ok(())
    }

    /// Program bytes as little endian words, padding an odd tail with an
    /// erased byte.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks_exact(2);
        let mut a = addr;
        for pair in chunks.by_ref() {
            self.flash
                .write_word(a, u16::from_le_bytes([pair[0], pair[1]]))?;
            a += 2;
        }
        if let [last] = chunks.remainder() {
            self.flash.write_word(a, u16::from_le_bytes([*last, 0xFF]))?;
        }
        Ok(())
    }

    fn is_blank(&mut self, section: Range<u32>) -> Result<bool> {
        let mut buf = [0u8; COPY_CHUNK];
        let mut addr = section.start;
        while addr < section.end {
            let n = ((section.end - addr) as usize).min(COPY_CHUNK);
            self.flash.read(addr, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            addr += n as u32;
        }
        Ok(true)
    }

    fn erase_section(&mut self, section: Range<u32>) -> Result<()> {
        let sector_size = self.flash.sector_size();
        let sectors = section.start / sector_size..section.end / sector_size;
        debug!("Erasing sectors {sectors:?}");
        self.flash.erase(sectors).inspect_err(|e| {
            error!("Flash erase failed: {e:?}");
        })
    }
}

fn read_header<F: FlashDevice>(flash: &mut F, addr: u32) -> Result<BlockHeader> {
    let mut bytes = [0u8; HEADER_SIZE as usize];
    flash.read(addr, &mut bytes)?;
    Ok(BlockHeader::from_bytes(bytes))
}

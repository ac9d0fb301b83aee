//! Outbound frame writer.
//!
//! A frame is sent in three steps so large payloads (the result table) can
//! be streamed straight from their source without staging them in RAM:
//!
//! ```ignore
//! writer.start(&mut uart, FrameType::Text, msg.len())?;
//! writer.put(&mut uart, msg)?;
//! writer.end(&mut uart)?;
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::checksum::Checksum;
use crate::frame::{FrameType, OUTBOUND_MAGIC};
use crate::io::ByteTransport;

/// Device to host frame writer.  Owns the send-side checksum.
#[derive(Debug, Default)]
pub struct FrameWriter {
    checksum: Checksum,
    remaining: usize,
}

impl FrameWriter {
    pub const fn new() -> Self {
        Self {
            checksum: Checksum::new(),
            remaining: 0,
        }
    }

    /// Send the frame header.  `len` is the payload length in bytes.
    pub fn start<T: ByteTransport>(
        &mut self,
        transport: &mut T,
        frame_type: FrameType,
        len: usize,
    ) -> Result<()> {
        if self.remaining != 0 {
            warn!("Previous frame short by {} bytes", self.remaining);
        }
        trace!("Sending {frame_type:?} frame, {len} bytes");

        self.checksum.reset();
        self.remaining = len;
        self.emit(transport, &OUTBOUND_MAGIC)?;
        self.emit(transport, &(len as u32).to_le_bytes())?;
        self.emit(transport, &[frame_type as u8])
    }

    /// Send payload bytes.
    pub fn put<T: ByteTransport>(&mut self, transport: &mut T, bytes: &[u8]) -> Result<()> {
        self.remaining = self.remaining.saturating_sub(bytes.len());
        self.emit(transport, bytes)
    }

    /// Send payload bytes from an iterator, one at a time.
    pub fn put_iter<T, I>(&mut self, transport: &mut T, bytes: I) -> Result<()>
    where
        T: ByteTransport,
        I: IntoIterator<Item = u8>,
    {
        for b in bytes {
            self.put(transport, &[b])?;
        }
        Ok(())
    }

    /// Send the checksum, completing the frame.
    pub fn end<T: ByteTransport>(&mut self, transport: &mut T) -> Result<()> {
        if self.remaining != 0 {
            warn!("Frame ended {} bytes short", self.remaining);
            self.remaining = 0;
        }
        transport.put_byte(self.checksum.extract())
    }

    /// Send a complete frame with a payload held in memory.
    pub fn send<T: ByteTransport>(
        &mut self,
        transport: &mut T,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<()> {
        self.start(transport, frame_type, payload.len())?;
        self.put(transport, payload)?;
        self.end(transport)
    }

    fn emit<T: ByteTransport>(&mut self, transport: &mut T, bytes: &[u8]) -> Result<()> {
        self.checksum.update_slice(bytes);
        transport.put_block(bytes)
    }
}

//! In-memory collaborators for unit tests.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::VecDeque;
use std::vec::Vec;

use crate::io::{ByteTransport, ResetControl, SamplingSource};
use crate::personality::MeasureConfig;
use crate::{Error, Result};

/// Scripted byte transport.  Reads come from a queue, writes are recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the device to receive.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn rx_pending(&self) -> usize {
        self.rx.len()
    }

    /// Everything written so far
    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    /// Everything written so far, clearing the record.
    pub fn take_sent(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl ByteTransport for MockTransport {
    fn get_byte(&mut self) -> Result<u8> {
        self.rx.pop_front().ok_or(Error::NoData)
    }

    fn put_byte(&mut self, byte: u8) -> Result<()> {
        self.tx.push(byte);
        Ok(())
    }

    fn byte_available(&mut self) -> bool {
        !self.rx.is_empty()
    }
}

/// Sampling source that records start and stop requests.
#[derive(Debug, Default)]
pub struct MockSource {
    pub started: Vec<MeasureConfig>,
    pub stops: usize,
    pub running: bool,
}

impl SamplingSource for MockSource {
    fn start(&mut self, config: &MeasureConfig) {
        self.started.push(*config);
        self.running = true;
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.running = false;
    }
}

/// Reset control that counts requests.
#[derive(Debug, Default)]
pub struct MockReset {
    pub resets: usize,
}

impl ResetControl for MockReset {
    fn soft_reset(&mut self) {
        self.resets += 1;
    }
}

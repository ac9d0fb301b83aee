//! Inbound command frame parser.
//!
//! The parser is fed one byte at a time from the main loop.  It never
//! blocks and never fails hard: anything unexpected (a wrong magic byte, an
//! out of range parameter length, a checksum mismatch, an unknown command)
//! discards the partial frame and the parser goes back to hunting for the
//! magic.  Those events are reported as `Err` from [`FrameParser::feed()`]
//! purely for diagnostics.
//!
//! Parameters are collected into a scratch buffer and only handed out once
//! the checksum has matched, so a corrupt frame can never overwrite the
//! caller's parameters.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use heapless::Vec;

use crate::checksum::Checksum;
use crate::frame::{Command, INBOUND_MAGIC, MAX_PARAM_LENGTH};
use crate::personality::Personality;
use crate::{Error, Result};

/// Parameter bytes of one command frame
pub type ParamBuf = Vec<u8, MAX_PARAM_LENGTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Magic,
    Command,
    Length,
    Param,
    Checksum,
}

/// A complete, checksum-verified command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: Command,
    /// The frame's parameters, or `None` if the frame arrived while
    /// parameters were not being accepted.  May be empty.
    pub params: Option<ParamBuf>,
}

/// Byte-at-a-time inbound frame parser.
#[derive(Debug)]
pub struct FrameParser {
    state: ParserState,
    magic_index: usize,
    checksum: Checksum,
    command: u8,
    length: usize,
    accepting: bool,
    scratch: ParamBuf,
    min_param_size: usize,
    errors: u32,
}

impl FrameParser {
    /// Create a parser validating parameter lengths for `personality`.
    pub fn new(personality: &Personality) -> Self {
        Self {
            state: ParserState::Magic,
            magic_index: 0,
            checksum: Checksum::new(),
            command: 0,
            length: 0,
            accepting: false,
            scratch: Vec::new(),
            min_param_size: personality.min_param_size(),
            errors: 0,
        }
    }

    /// Number of frames discarded since creation
    pub fn error_count(&self) -> u32 {
        self.errors
    }

    /// Whether the parser is between frames.
    pub fn is_idle(&self) -> bool {
        self.state == ParserState::Magic && self.magic_index == 0
    }

    /// Feed one received byte.
    ///
    /// `accept_params` says whether the caller currently takes parameters
    /// (the firmware is READY).  It is sampled when the length byte
    /// arrives.
    ///
    /// Returns `Ok(Some(frame))` once a frame is complete and verified,
    /// `Ok(None)` while a frame is in progress and `Err` when a frame was
    /// discarded.
    pub fn feed(&mut self, byte: u8, accept_params: bool) -> Result<Option<CommandFrame>> {
        match self.state {
            ParserState::Magic => {
                self.match_magic(byte);
                Ok(None)
            }
            ParserState::Command => {
                self.checksum.update(byte);
                self.command = byte;
                self.state = ParserState::Length;
                Ok(None)
            }
            ParserState::Length => {
                self.checksum.update(byte);
                let len = byte as usize;
                if len != 0 && (len < self.min_param_size || len >= MAX_PARAM_LENGTH) {
                    warn!("Bad parameter length {len} for command {:#04x}", self.command);
                    return Err(self.discard(Error::InvalidFrame));
                }
                self.length = len;
                self.accepting = accept_params;
                self.scratch.clear();
                self.state = if len == 0 {
                    ParserState::Checksum
                } else {
                    ParserState::Param
                };
                Ok(None)
            }
            ParserState::Param => {
                self.checksum.update(byte);
                // Cannot fail, the length was checked against the capacity
                let _ = self.scratch.push(byte);
                if self.scratch.len() >= self.length {
                    self.state = ParserState::Checksum;
                }
                Ok(None)
            }
            ParserState::Checksum => {
                if !self.checksum.matches(byte) {
                    warn!(
                        "Checksum mismatch: got {byte:#04x}, expected {:#04x}",
                        self.checksum.extract()
                    );
                    return Err(self.discard(Error::Checksum));
                }

                let command = match Command::try_from(self.command) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!("Unknown command {:#04x}", self.command);
                        return Err(self.discard(e));
                    }
                };

                let params = if self.accepting {
                    Some(self.scratch.clone())
                } else {
                    None
                };
                trace!("Received {command:?}, {} parameter bytes", self.length);
                self.restart();
                Ok(Some(CommandFrame { command, params }))
            }
        }
    }

    fn match_magic(&mut self, byte: u8) {
        if self.magic_index == 0 {
            self.checksum.reset();
        }

        if byte == INBOUND_MAGIC[self.magic_index] {
            self.checksum.update(byte);
            self.magic_index += 1;
            if self.magic_index == INBOUND_MAGIC.len() {
                self.magic_index = 0;
                self.state = ParserState::Command;
            }
        } else if self.magic_index != 0 {
            // The mismatching byte may itself start a new frame
            self.checksum.reset();
            self.magic_index = 0;
            if byte == INBOUND_MAGIC[0] {
                self.checksum.update(byte);
                self.magic_index = 1;
            }
        }
    }

    fn restart(&mut self) {
        self.state = ParserState::Magic;
        self.magic_index = 0;
        self.length = 0;
        self.scratch.clear();
        self.checksum.reset();
    }

    fn discard(&mut self, error: Error) -> Error {
        self.errors = self.errors.wrapping_add(1);
        self.restart();
        error
    }
}

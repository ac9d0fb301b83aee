//! Firmware state machine.
//!
//! ```text
//!            MEASURE                 finished / ABORT
//!   READY ------------> MEASURING ------------------> DONE
//!     |                    |  ^                        |
//!     |                    +--+ INTERMEDIATE           |
//!     +------ RESET -----> (device reset) <-- RESET ---+
//! ```
//!
//! [`Firmware::poll()`] is the main loop body.  In READY and DONE it blocks
//! on the next transport byte.  In MEASURING it alternates between checking
//! the finished flag raised by the interrupt lane and checking whether a
//! byte has arrived, so a finished measurement is reported without waiting
//! for host input.
//!
//! Every state change is announced to the host with a STATE frame.  A
//! command that is not valid in the current state re-announces the state.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(test)]
mod tests;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::acquisition::DeviceContext;
use crate::frame::{
    Command, CommandFrame, DeviceState, FrameParser, FrameType, FrameWriter, MAX_PARAM_LENGTH,
    PARAM_BLOCK_ID, ParamBuf, Reason, VALUE_TABLE_HEADER_LEN,
};
use crate::io::{ByteTransport, FlashDevice, ResetControl, SamplingSource};
use crate::personality::{MeasureConfig, PERSONALITY_INFO_HEADER_LEN, Personality};
use crate::store::EepFlash;
use crate::{Error, Result};

/// Version string sent at boot
pub const VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// Firmware state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Measuring,
    Done,
}

impl From<State> for DeviceState {
    fn from(state: State) -> Self {
        match state {
            State::Ready => DeviceState::Ready,
            State::Measuring => DeviceState::Measuring,
            State::Done => DeviceState::Done,
        }
    }
}

/// Outcome of one [`Firmware::poll()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Measuring and nothing happened
    Idle,
    /// Input was processed or an event handled
    Continue,
    /// A reset was announced and requested.  Stop polling.
    Reset,
}

/// The device firmware, owning its collaborators.
///
/// - `N` is the result table size in bytes
/// - `BLOCKS` is the number of store block ids
pub struct Firmware<'a, T, F, S, R, const N: usize, const BLOCKS: usize>
where
    T: ByteTransport,
    F: FlashDevice,
    S: SamplingSource,
    R: ResetControl,
{
    transport: T,
    context: &'a DeviceContext<N>,
    store: EepFlash<F, BLOCKS>,
    source: S,
    reset: R,
    personality: Personality,
    params: ParamBuf,
    parser: FrameParser,
    writer: FrameWriter,
    state: State,
    switch_armed: bool,
    reset_requested: bool,
}

impl<'a, T, F, S, R, const N: usize, const BLOCKS: usize> Firmware<'a, T, F, S, R, N, BLOCKS>
where
    T: ByteTransport,
    F: FlashDevice,
    S: SamplingSource,
    R: ResetControl,
{
    /// Create the firmware.  `context` must have been created for the same
    /// `personality`.
    pub fn new(
        transport: T,
        context: &'a DeviceContext<N>,
        store: EepFlash<F, BLOCKS>,
        source: S,
        reset: R,
        personality: Personality,
    ) -> Self {
        Self {
            transport,
            context,
            store,
            source,
            reset,
            parser: FrameParser::new(&personality),
            personality,
            params: ParamBuf::new(),
            writer: FrameWriter::new(),
            state: State::Ready,
            switch_armed: true,
            reset_requested: false,
        }
    }

    /// Announce the firmware, load the stored parameters and enter READY.
    /// Stored data that cannot be used is reported to the host and the
    /// device starts without parameters.
    pub fn boot(&mut self) -> Result<()> {
        self.text("Booting")?;
        self.text(VERSION)?;

        match self.load_stored_params() {
            Ok(Some(params)) => {
                debug!("Loaded {} stored parameter bytes", params.len());
                self.params = params;
            }
            Ok(None) => debug!("No stored parameters"),
            Err(Error::InvalidParams) => {
                warn!("Stored parameters invalid");
                self.text("invalid stored data")?;
            }
            Err(e) => {
                error!("Reading stored parameters failed: {e:?}");
                self.text("parameter store read failed")?;
            }
        }

        info!("{} ready", self.personality.name);
        self.enter(State::Ready)
    }

    /// Run one iteration of the main loop.
    pub fn poll(&mut self) -> Result<Poll> {
        if self.reset_requested {
            return Ok(Poll::Reset);
        }

        if self.state == State::Measuring {
            if self.context.is_finished() {
                debug!("Measurement finished");
                self.finish(Reason::Done)?;
                return Ok(Poll::Continue);
            }
            if !self.transport.byte_available() {
                return Ok(Poll::Idle);
            }
        }

        let byte = self.transport.get_byte()?;
        match self.parser.feed(byte, self.state == State::Ready) {
            Ok(Some(frame)) => self.dispatch(frame),
            Ok(None) => Ok(Poll::Continue),
            Err(e) => {
                debug!("Discarded inbound frame: {e:?}");
                Ok(Poll::Continue)
            }
        }
    }

    /// Hardware start switch event.
    ///
    /// The first press in READY starts a measurement with the current
    /// parameters.  The switch then stays inactive until the next reset.
    pub fn switch_pressed(&mut self) -> Result<()> {
        if !self.switch_armed || self.state != State::Ready {
            trace!("Start switch ignored");
            return Ok(());
        }
        self.switch_armed = false;
        info!("Start switch pressed");
        let params = self.params.clone();
        self.start_measurement(params)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Parameters the next parameterless MEASURE uses
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn personality(&self) -> &Personality {
        &self.personality
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn reset_control(&self) -> &R {
        &self.reset
    }

    pub fn store_mut(&mut self) -> &mut EepFlash<F, BLOCKS> {
        &mut self.store
    }

    /// Frames discarded by the inbound parser
    pub fn rx_errors(&self) -> u32 {
        self.parser.error_count()
    }
}

// Command handling
impl<T, F, S, R, const N: usize, const BLOCKS: usize> Firmware<'_, T, F, S, R, N, BLOCKS>
where
    T: ByteTransport,
    F: FlashDevice,
    S: SamplingSource,
    R: ResetControl,
{
    fn dispatch(&mut self, frame: CommandFrame) -> Result<Poll> {
        debug!("{:?} in {:?}", frame.command, self.state);

        match (self.state, frame.command) {
            (State::Ready | State::Done, Command::Reset) => return self.reset_device(),

            (State::Ready, Command::Measure) => {
                let params = match frame.params {
                    Some(p) if !p.is_empty() => p,
                    _ => self.params.clone(),
                };
                self.start_measurement(params)?;
            }
            (State::Ready, Command::ParamsToStore) => {
                if let Some(p) = frame.params.filter(|p| !p.is_empty()) {
                    self.params = p;
                }
                if let Some(poll) = self.store_params()? {
                    return Ok(poll);
                }
            }
            (State::Ready, Command::ParamsFromStore) => {
                self.send_stored_params()?;
                self.enter(State::Ready)?;
            }
            (State::Ready, Command::PersonalityInfo) => {
                self.send_personality_info()?;
                self.enter(State::Ready)?;
            }

            (State::Measuring, Command::Abort) => self.finish(Reason::Aborted)?,
            (State::Measuring, Command::Intermediate) => self.send_table(Reason::Intermediate)?,

            (State::Done, Command::State) => self.enter(State::Done)?,
            (State::Done, _) => {
                self.send_table(Reason::Resend)?;
                self.enter(State::Done)?;
            }

            (state, _) => self.enter(state)?,
        }

        Ok(Poll::Continue)
    }

    fn start_measurement(&mut self, params: ParamBuf) -> Result<()> {
        let config = match self.personality.parse_params(&params) {
            Ok(config) => config,
            Err(e) => {
                warn!("Measurement parameters rejected: {e:?}");
                self.text(self.rejection_reason(&params))?;
                return self.enter(State::Ready);
            }
        };

        self.params = params;
        self.arm(config);
        self.enter(State::Measuring)
    }

    fn rejection_reason(&self, params: &[u8]) -> &'static str {
        if params.len() < self.personality.min_param_size() {
            "missing measurement parameters"
        } else {
            "measurement duration 0 rejected"
        }
    }

    fn arm(&mut self, config: MeasureConfig) {
        debug!(
            "Measuring for {} units, skipping {} samples",
            config.duration, config.skip_samples
        );
        self.context.arm(config);
        self.source.start(&config);
    }

    fn finish(&mut self, reason: Reason) -> Result<()> {
        self.source.stop();
        self.context.halt();
        self.send_table(reason)?;
        self.enter(State::Done)
    }

    fn store_params(&mut self) -> Result<Option<Poll>> {
        if self.params.is_empty() {
            self.text("no parameters to store")?;
            self.enter(State::Ready)?;
            return Ok(None);
        }

        match self.store.write(PARAM_BLOCK_ID, &self.params) {
            Ok(()) => {
                debug!("Stored {} parameter bytes", self.params.len());
                self.enter(State::Ready)?;
                Ok(None)
            }
            Err(e) => {
                error!("Storing parameters failed: {e:?}");
                self.text("parameter store failed")?;
                self.reset_device().map(Some)
            }
        }
    }

    fn send_stored_params(&mut self) -> Result<()> {
        match self.load_stored_params() {
            Ok(Some(params)) => {
                self.writer
                    .send(&mut self.transport, FrameType::ParamsFromStore, &params)?;
                self.params = params;
                Ok(())
            }
            Ok(None) => self.text("no stored parameters"),
            Err(Error::InvalidParams) => self.text("invalid stored data"),
            Err(e) => {
                error!("Reading stored parameters failed: {e:?}");
                self.text("parameter store read failed")
            }
        }
    }

    /// Read the parameter block.  Data that cannot be a parameter set for
    /// this personality is [`Error::InvalidParams`].
    fn load_stored_params(&mut self) -> Result<Option<ParamBuf>> {
        let mut buf = [0u8; MAX_PARAM_LENGTH];
        let len = match self.store.read(PARAM_BLOCK_ID, &mut buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(Error::BufferTooSmall) => return Err(Error::InvalidParams),
            Err(e) => return Err(e),
        };
        if len == 0 || !self.personality.accepts_param_length(len) {
            return Err(Error::InvalidParams);
        }
        ParamBuf::from_slice(&buf[..len])
            .map(Some)
            .map_err(|_| Error::InvalidParams)
    }

    fn reset_device(&mut self) -> Result<Poll> {
        info!("Resetting");
        self.announce(DeviceState::Reset)?;
        self.reset_requested = true;
        self.reset.soft_reset();
        Ok(Poll::Reset)
    }
}

// Frame output
impl<T, F, S, R, const N: usize, const BLOCKS: usize> Firmware<'_, T, F, S, R, N, BLOCKS>
where
    T: ByteTransport,
    F: FlashDevice,
    S: SamplingSource,
    R: ResetControl,
{
    fn enter(&mut self, state: State) -> Result<()> {
        if state != self.state {
            debug!("{:?} -> {state:?}", self.state);
        }
        self.state = state;
        self.announce(state.into())
    }

    fn announce(&mut self, state: DeviceState) -> Result<()> {
        self.writer
            .send(&mut self.transport, FrameType::State, &[state as u8])
    }

    fn text(&mut self, msg: &str) -> Result<()> {
        self.writer
            .send(&mut self.transport, FrameType::Text, msg.as_bytes())
    }

    /// Stream the result table.  The table size is sampled once so a table
    /// that grows during an intermediate read is sent consistently.
    fn send_table(&mut self, reason: Reason) -> Result<()> {
        let context = self.context;
        let table = context.table();
        let size = table.size_bytes();
        let config = context.config();
        let elapsed = context.elapsed().to_le_bytes();
        let requested = config.duration.to_le_bytes();

        let header: [u8; VALUE_TABLE_HEADER_LEN] = [
            table.element_size() as u8,
            reason as u8,
            table.kind() as u8,
            self.params.len() as u8,
            elapsed[0],
            elapsed[1],
            requested[0],
            requested[1],
            0,
            0,
        ];
        trace!("Sending table, {reason:?}, {size} bytes");

        let len = header.len() + self.params.len() + size;
        self.writer
            .start(&mut self.transport, FrameType::ValueTable, len)?;
        self.writer.put(&mut self.transport, &header)?;
        self.writer.put(&mut self.transport, &self.params)?;
        self.writer
            .put_iter(&mut self.transport, table.leading_bytes(size))?;
        self.writer.end(&mut self.transport)
    }

    fn send_personality_info(&mut self) -> Result<()> {
        let table = self.context.table();
        let table_bytes = table.capacity() * table.element_size().bytes();
        let header: [u8; PERSONALITY_INFO_HEADER_LEN] = self.personality.info_header(table_bytes);
        let name = self.personality.name.as_bytes();

        self.writer.start(
            &mut self.transport,
            FrameType::PersonalityInfo,
            header.len() + name.len(),
        )?;
        self.writer.put(&mut self.transport, &header)?;
        self.writer.put(&mut self.transport, name)?;
        self.writer.end(&mut self.transport)
    }
}

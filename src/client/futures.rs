//! Asynchronous host client - typically used on a PC talking to the device
//! over a serial port.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use alloc::vec::Vec;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::client::{
    DeviceFrame, DeviceFrameDecoder, MAX_COMMAND_FRAME_LEN, RawFrame, encode_command,
};
use crate::frame::{Command, DeviceState, FrameType};
use crate::{Error, Result};

/// Byte stream to the device.
///
/// Application must provide an implementation of this trait, for example
/// on top of a serial port crate.  This keeps the client free of any
/// specific async runtime.
#[async_trait(?Send)]
pub trait AsyncTransport {
    /// Write all of `data`.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read at least one byte into `buf`, returning the number read.
    /// Returning 0 means the stream has ended.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Async client driving the device's command protocol.
///
/// `N` is the largest frame payload the client accepts.  It must hold the
/// device's whole result table plus the value table header.
///
/// Example usage:
///
/// ```rust,ignore
/// use mca_firmware::client::{AsyncHostClient, DeviceFrame};
///
/// let mut serial = ...; // implement AsyncTransport
/// let mut client = AsyncHostClient::<_, 4096>::new(&mut serial);
/// client.measure(&[0x2c, 0x01, 0x00, 0x00]).await?;
/// let result = client.wait_result().await?;
/// if let DeviceFrame::ValueTable(table) = result.parse()? {
///     // Process table.elements()...
/// }
/// ```
pub struct AsyncHostClient<'a, T: AsyncTransport, const N: usize> {
    transport: &'a mut T,
    decoder: DeviceFrameDecoder<N>,
    rx: Vec<u8>,
    rx_pos: usize,
}

impl<'a, T: AsyncTransport, const N: usize> AsyncHostClient<'a, T, N> {
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            decoder: DeviceFrameDecoder::new(),
            rx: Vec::new(),
            rx_pos: 0,
        }
    }

    /// Send a command frame.
    pub async fn send_command(&mut self, command: Command, params: &[u8]) -> Result<()> {
        let mut buf = [0u8; MAX_COMMAND_FRAME_LEN];
        let len = encode_command(command, params, &mut buf)?;
        debug!("Sending {command:?} ({} parameter bytes)", params.len());
        self.transport.write_all(&buf[..len]).await
    }

    /// Receive the next intact frame.  Damaged frames are logged and
    /// skipped.
    pub async fn next_frame(&mut self) -> Result<RawFrame<N>> {
        loop {
            while self.rx_pos < self.rx.len() {
                let byte = self.rx[self.rx_pos];
                self.rx_pos += 1;
                match self.decoder.push(byte) {
                    Ok(Some(frame)) => return Ok(frame),
                    Ok(None) => {}
                    Err(e) => warn!("Dropped device frame: {e:?}"),
                }
            }

            self.rx.resize(64, 0);
            let n = self.transport.read(&mut self.rx).await?;
            if n == 0 {
                return Err(Error::NoData);
            }
            self.rx.truncate(n);
            self.rx_pos = 0;
        }
    }

    /// Receive frames until one of type `frame_type` arrives.  Text frames
    /// passed over on the way are logged.
    pub async fn wait_for(&mut self, frame_type: FrameType) -> Result<RawFrame<N>> {
        loop {
            let frame = self.next_frame().await?;
            if frame.frame_type == frame_type {
                return Ok(frame);
            }
            match frame.parse() {
                Ok(DeviceFrame::Text(text)) => info!("Device: {text}"),
                Ok(DeviceFrame::State(state)) => debug!("Device state {state:?}"),
                Ok(_) => debug!("Skipping {:?} frame", frame.frame_type),
                Err(e) => warn!("Undecodable {:?} frame: {e:?}", frame.frame_type),
            }
        }
    }

    /// Receive frames until a state announcement arrives and return it.
    pub async fn next_state(&mut self) -> Result<DeviceState> {
        let frame = self.wait_for(FrameType::State).await?;
        match frame.parse()? {
            DeviceFrame::State(state) => Ok(state),
            _ => Err(Error::InvalidFrame),
        }
    }

    /// Receive state announcements until `expected` arrives.
    pub async fn wait_state(&mut self, expected: DeviceState) -> Result<()> {
        loop {
            let state = self.next_state().await?;
            if state == expected {
                return Ok(());
            }
            debug!("Device is {state:?}, waiting for {expected:?}");
        }
    }

    /// Ask for the current state.
    pub async fn state(&mut self) -> Result<DeviceState> {
        self.send_command(Command::State, &[]).await?;
        self.next_state().await
    }

    /// Start a measurement.  Empty `params` reuses the device's current
    /// parameters.  Returns the state the device announced in response.
    pub async fn measure(&mut self, params: &[u8]) -> Result<DeviceState> {
        self.send_command(Command::Measure, params).await?;
        self.next_state().await
    }

    /// Request the running measurement's table without stopping it.
    pub async fn intermediate(&mut self) -> Result<RawFrame<N>> {
        self.send_command(Command::Intermediate, &[]).await?;
        self.wait_for(FrameType::ValueTable).await
    }

    /// Stop the running measurement and return its partial table.
    pub async fn abort(&mut self) -> Result<RawFrame<N>> {
        self.send_command(Command::Abort, &[]).await?;
        self.wait_for(FrameType::ValueTable).await
    }

    /// Wait for a measurement to complete and return its table.
    pub async fn wait_result(&mut self) -> Result<RawFrame<N>> {
        self.wait_for(FrameType::ValueTable).await
    }

    /// Fetch the personality descriptor.
    pub async fn personality_info(&mut self) -> Result<RawFrame<N>> {
        self.send_command(Command::PersonalityInfo, &[]).await?;
        self.wait_for(FrameType::PersonalityInfo).await
    }

    /// Persist `params` as the device's default parameters.
    pub async fn store_params(&mut self, params: &[u8]) -> Result<DeviceState> {
        self.send_command(Command::ParamsToStore, params).await?;
        self.next_state().await
    }

    /// Read the persisted parameters.  `None` if the device has none.
    pub async fn stored_params(&mut self) -> Result<Option<Vec<u8>>> {
        self.send_command(Command::ParamsFromStore, &[]).await?;
        let mut params = None;
        loop {
            let frame = self.next_frame().await?;
            match frame.parse() {
                Ok(DeviceFrame::StoredParams(p)) => params = Some(p.to_vec()),
                Ok(DeviceFrame::State(_)) => return Ok(params),
                Ok(DeviceFrame::Text(text)) => info!("Device: {text}"),
                Ok(_) => debug!("Skipping {:?} frame", frame.frame_type),
                Err(e) => warn!("Undecodable {:?} frame: {e:?}", frame.frame_type),
            }
        }
    }

    /// Reset the device.  Returns once the reset was announced.
    pub async fn reset(&mut self) -> Result<()> {
        self.send_command(Command::Reset, &[]).await?;
        self.wait_state(DeviceState::Reset).await
    }
}

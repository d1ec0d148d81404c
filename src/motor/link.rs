// Half-duplex frame transport
//
// The bus is strictly request/response: write one 10-byte frame, then block on
// one 10-byte reply until a timeout. Frame boundaries are byte counts only.

use serialport::{self, ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace};

use super::error::{MotorError, Result};
use super::protocol::{FRAME_LEN, Frame};
use crate::config::{DEFAULT_BAUDRATE, SERIAL_TIMEOUT};

/// One open, exclusively owned connection to the bus
pub trait Link: Send {
    /// Write a whole frame and flush it
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Read exactly one frame; `Timeout` when nothing (or only part of a frame)
    /// arrives in time
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame>;

    /// Drop any stale bytes still waiting in the input buffer
    fn clear_input(&mut self) -> Result<()>;
}

/// Opens links to a named port
pub trait Connector: Send + Sync {
    fn port_name(&self) -> &str;
    fn open(&self) -> Result<Box<dyn Link>>;
}

/// Serial port link, 8N1
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open a new connection to the motor bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(SERIAL_TIMEOUT)
            .open()?;

        port.clear(ClearBuffer::All)?;
        debug!("Opened {} at {} baud", port_name, baudrate);
        Ok(Self { port })
    }
}

impl Link for SerialLink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        trace!("TX {:02X?}", frame);
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Frame> {
        self.port.set_timeout(timeout)?;

        let mut frame = [0u8; FRAME_LEN];
        self.port.read_exact(&mut frame).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::UnexpectedEof => {
                MotorError::Timeout
            }
            _ => MotorError::Io(e),
        })?;

        trace!("RX {:02X?}", frame);
        Ok(frame)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Opens `SerialLink`s to one port
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baudrate: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>) -> Self {
        Self::with_baudrate(port, DEFAULT_BAUDRATE)
    }

    pub fn with_baudrate(port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
        }
    }
}

impl Connector for SerialConnector {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn open(&self) -> Result<Box<dyn Link>> {
        let link = SerialLink::open_with_baudrate(&self.port, self.baudrate)?;
        Ok(Box::new(link))
    }
}

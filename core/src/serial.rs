//! Serial transport to the controller hardware.
//!
//! Protocol code talks to a [`SerialIo`] trait so it can run against a
//! scripted mock in tests; [`SerialDevice`] is the real implementation
//! on top of the `serialport` crate.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::*;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

/// Transport-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port not found")]
    PortNotFound,
    #[error("serial port is in use by another application")]
    PortInUse,
    #[error("unable to configure the serial port")]
    ConfigError,
    #[error("the serial port does not support the required baud rate")]
    BaudUnsupported,
    #[error("timed out waiting for serial data")]
    Timeout,
    #[error("short serial transfer")]
    Short,
    #[error("serial transfer aborted")]
    Aborted,
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read timeout profile. Short mode pumps a live data stream without
/// stalling on gaps; long mode covers command/response turnarounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// 10ms, for streaming
    Short,
    /// 2s, for commands
    Long,
}

impl TimeoutMode {
    fn duration(self) -> Duration {
        match self {
            Self::Short => Duration::from_millis(10),
            Self::Long => Duration::from_secs(2),
        }
    }
}

/// Byte-level access to the controller link.
pub trait SerialIo: Send {
    /// Reads exactly `buf.len()` bytes or fails.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Reads up to `buf.len()` bytes; returns 0 on timeout.
    fn read_upto(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Discards any pending receive data.
    fn purge_rx(&mut self) -> Result<(), TransportError>;

    fn set_timeout_mode(&mut self, mode: TimeoutMode) -> Result<(), TransportError>;

    /// Drives the DTR line; used to reset microcontroller boards.
    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError>;
}

/// A physical serial port.
pub struct SerialDevice {
    port: Box<dyn SerialPort>,
}

impl SerialDevice {
    /// Opens `name` at `baud`, 8N1, no flow control.
    pub fn open(name: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(name, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(TimeoutMode::Long.duration())
            .open()
            .map_err(|e| Self::map_open_error(name, baud, e))?;

        debug!("Opened serial port {} at {} baud", name, baud);
        Ok(Self { port })
    }

    fn map_open_error(name: &str, baud: u32, e: serialport::Error) -> TransportError {
        warn!("Failed to open {} at {} baud: {}", name, baud, e);
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::PortNotFound,
            serialport::ErrorKind::InvalidInput => TransportError::ConfigError,
            serialport::ErrorKind::Io(ErrorKind::NotFound) => TransportError::PortNotFound,
            serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => TransportError::PortInUse,
            serialport::ErrorKind::Io(kind) => TransportError::Io(kind.into()),
            serialport::ErrorKind::Unknown => TransportError::ConfigError,
        }
    }

    /// Opens at `baud`, distinguishing a port that cannot do the rate
    /// from one that cannot be configured at all by re-probing at 9600.
    pub fn open_with_baud_probe(name: &str, baud: u32) -> Result<Self, TransportError> {
        match Self::open(name, baud) {
            Ok(dev) => Ok(dev),
            Err(TransportError::ConfigError) => match Self::open(name, 9600) {
                Ok(_) => Err(TransportError::BaudUnsupported),
                Err(_) => Err(TransportError::ConfigError),
            },
            Err(e) => Err(e),
        }
    }
}

impl SerialIo for SerialDevice {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut done = 0;
        while done < buf.len() {
            match self.port.read(&mut buf[done..]) {
                Ok(0) => {
                    return Err(if done == 0 {
                        TransportError::Timeout
                    } else {
                        TransportError::Short
                    });
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    return Err(if done == 0 {
                        TransportError::Timeout
                    } else {
                        TransportError::Short
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_upto(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(buf)?;
        Ok(())
    }

    fn purge_rx(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|_| TransportError::ConfigError)
    }

    fn set_timeout_mode(&mut self, mode: TimeoutMode) -> Result<(), TransportError> {
        self.port
            .set_timeout(mode.duration())
            .map_err(|_| TransportError::ConfigError)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(|_| TransportError::ConfigError)
    }
}

/// Platform name for a numbered serial port (1-based, COM-style).
pub fn port_name(number: u8) -> String {
    if cfg!(windows) {
        format!("COM{}", number)
    } else {
        format!("/dev/ttyUSB{}", number.saturating_sub(1))
    }
}

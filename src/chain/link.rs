// Serial transport for the chain
//
// Non-blocking byte pipe: `read_available` returns whatever has arrived (possibly
// nothing), `write` queues bytes for the next board.

use serialport::{self, SerialPort};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait SerialLink {
    /// Read up to `buf.len()` already-received bytes without waiting
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn write(&mut self, data: &[u8]) -> Result<(), LinkError>;
}

/// Chain link over a UART
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self, LinkError> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(1))
            .open()?;
        debug!("Opened chain link {} at {} baud", port_name, baudrate);
        Ok(Self { port })
    }
}

impl SerialLink for SerialPortLink {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let pending = self.port.bytes_to_read()? as usize;
        let n = pending.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        match self.port.read(&mut buf[..n]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}

/// In-memory link: bytes injected on one side, writes collected on the other
#[derive(Debug, Default)]
pub struct MemoryLink {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make bytes available to `read_available`
    pub fn inject(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Drain everything written so far
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl SerialLink for MemoryLink {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.tx.extend_from_slice(data);
        Ok(())
    }
}

//! FMU bootloader wire protocol: command bytes and the framed link.
//!
//! Every exchange has the same shape: a command byte, optional argument
//! bytes, and the `EOC` terminator; the bootloader answers with `INSYNC`
//! followed by a status byte, optionally preceded by a 4-byte
//! little-endian payload for integer-returning commands.
//!
//! ```text
//! host:   CMD [args...] EOC
//! device:           [u32 LE]  INSYNC  OK|FAILED|INVALID
//! ```

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::Port;

/// First byte of every bootloader reply.
pub const INSYNC: u8 = 0x12;
/// Terminator that ends a command's argument bytes.
pub const EOC: u8 = 0x20;

/// Status byte: command accepted.
pub const OK: u8 = 0x10;
/// Status byte: command ran and failed.
pub const FAILED: u8 = 0x11;
/// Status byte: command not valid for this bootloader revision.
pub const INVALID: u8 = 0x13;

/// Largest chunk `PROG_MULTI` accepts.
///
/// The protocol field is one byte, but the bootloader misbehaves at 64
/// and up, and the chunk must stay a multiple of 4.
pub const PROG_MULTI_MAX: usize = 60;
/// Largest chunk `READ_MULTI` returns.
pub const READ_MULTI_MAX: usize = 60;

/// Lowest bootloader protocol revision this crate speaks.
pub const BL_REV_MIN: u32 = 2;
/// Highest bootloader protocol revision this crate speaks.
pub const BL_REV_MAX: u32 = 4;

/// Bootloader command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Handshake probe (0x21).
    GetSync = 0x21,
    /// Query a device parameter (0x22), selected by [`Info`].
    GetDevice = 0x22,
    /// Erase the whole application flash (0x23).
    ChipErase = 0x23,
    /// Start a read-back verify pass (0x24, revision 2 only).
    ChipVerify = 0x24,
    /// Program a chunk of bytes (0x27).
    ProgMulti = 0x27,
    /// Read back a chunk of flash (0x28, revision 2 only).
    ReadMulti = 0x28,
    /// Ask the device for its flash CRC (0x29, revision 3+).
    GetCrc = 0x29,
    /// Boot the application (0x30).
    Reboot = 0x30,
}

/// `GET_DEVICE` parameter selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Info {
    /// Bootloader protocol revision.
    BlRev = 0x01,
    /// Board type identifier.
    BoardId = 0x02,
    /// Board hardware revision.
    BoardRev = 0x03,
    /// Maximum firmware size in bytes.
    FlashSize = 0x04,
}

/// Byte-level framing over an open serial port.
///
/// Owns the port for the lifetime of a session; opening and final closing
/// of the underlying device stay with the caller via [`into_port`].
///
/// [`into_port`]: BootloaderLink::into_port
pub struct BootloaderLink<P: Port> {
    port: P,
}

impl<P: Port> BootloaderLink<P> {
    /// Wrap an already-open port, applying the per-read timeout.
    pub fn new(mut port: P, read_timeout: Duration) -> Result<Self> {
        port.set_timeout(read_timeout)?;
        Ok(Self { port })
    }

    /// Write raw bytes to the stream.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("send {bytes:02x?}");
        self.port.write_all(bytes)?;
        Ok(())
    }

    /// Push any buffered output out to the device.
    pub fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    /// Discard unread input, e.g. leftovers from an interrupted exchange.
    pub fn drain_input(&mut self) -> Result<()> {
        self.port.clear_input()
    }

    /// Read exactly `count` bytes or fail with [`Error::Timeout`].
    pub fn recv(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::Timeout("timeout waiting for data".into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(Error::Timeout("timeout waiting for data".into()));
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
        trace!("recv {:02x?}", &buf);
        Ok(buf)
    }

    /// Read a little-endian 32-bit integer reply.
    pub fn recv_u32_le(&mut self) -> Result<u32> {
        let raw = self.recv(4)?;
        Ok(LittleEndian::read_u32(&raw))
    }

    /// Read and check the `INSYNC` + status handshake.
    pub fn expect_sync(&mut self) -> Result<()> {
        self.flush()?;
        let lead = self.recv(1)?[0];
        if lead != INSYNC {
            return Err(Error::Protocol(format!(
                "unexpected {lead:#04x} instead of INSYNC"
            )));
        }
        match self.recv(1)?[0] {
            OK => Ok(()),
            INVALID => Err(Error::UnsupportedOperation),
            FAILED => Err(Error::OperationFailed),
            other => Err(Error::Protocol(format!(
                "unexpected response {other:#04x} instead of OK"
            ))),
        }
    }

    /// Name of the underlying port.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the link and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }
}

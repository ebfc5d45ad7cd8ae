//! Serial transport for wire-protocol devices.
//!
//! Configures 8-bit, no-parity, no-flow-control framing with a per-read
//! character timeout. Reads are best effort and may return fewer bytes than
//! requested; callers poll against their own deadline. The transport knows
//! nothing about protocol semantics.

use crate::error::{self, Error, ErrorKind, TransportCause};
use crate::misc::LOGGER;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use slog::{debug, error, warn};

use std::io::{self, Read, Write};
use std::time::Duration;

/// Baud rates the attached hardware is known to accept
pub const RECOGNIZED_BAUDS: [u32; 4] = [19200, 38400, 57600, 115_200];

const DEFAULT_BAUD: u32 = 115_200;

/// Byte-stream seam between the protocol engine and the hardware; scripted
/// implementations stand in for a physical port in tests.
pub trait Transport: Send {
    /// Best-effort read; returns 0 when the character timeout expires with
    /// nothing buffered. May return fewer bytes than the buffer holds.
    fn recv(&mut self, buf: &mut [u8]) -> error::Result<usize>;

    /// Byte-wise read stopping after the end-of-line byte, a lapsed character
    /// timeout or a full buffer; returns the number of bytes collected.
    fn recv_until(&mut self, buf: &mut [u8], eol: u8) -> error::Result<usize>;

    /// Best-effort blocking write of the whole buffer
    fn write_all(&mut self, buf: &[u8]) -> error::Result<()>;
}

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

/// Resolve a requested baud rate; `None` means the request was not
/// recognized and the port keeps the default speed.
fn recognized_baud(baud: u32) -> Option<u32> {
    match baud {
        0 => Some(DEFAULT_BAUD),
        b if RECOGNIZED_BAUDS.contains(&b) => Some(b),
        _ => None,
    }
}

/// Classify an open failure into a diagnosable cause
fn open_cause(kind: serialport::ErrorKind) -> TransportCause {
    match kind {
        serialport::ErrorKind::NoDevice => TransportCause::NotFound,
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            TransportCause::PermissionDenied
        }
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => TransportCause::NotFound,
        serialport::ErrorKind::Io(io::ErrorKind::AddrInUse)
        | serialport::ErrorKind::Io(io::ErrorKind::WouldBlock) => TransportCause::Busy,
        _ => TransportCause::Other,
    }
}

fn report_open_failure(path: &str, cause: TransportCause, description: &str) {
    match cause {
        TransportCause::PermissionDenied => error!(
            LOGGER,
            "Do not have user privileges required to open {}", path
        ),
        TransportCause::Busy => {
            error!(LOGGER, "{} is already in use by another process", path)
        }
        TransportCause::NotFound => error!(LOGGER, "Device {} not found", path),
        TransportCause::Other => debug!(LOGGER, "Open {} failed: {}", path, description),
    }
}

/// Open `path` with 8N1 framing at the requested baud.
/// * `timeout_ds` - per-read character timeout in tenths of a second; zero is
///   promoted to one tenth since a read must always be bounded
/// * `purge` - discard anything pending in both FIFOs
pub fn open(path: &str, baud: u32, timeout_ds: u8, purge: bool) -> error::Result<SerialTransport> {
    let speed = recognized_baud(baud).unwrap_or_else(|| {
        warn!(LOGGER, "Unrecognized baud rate: {}", baud);
        DEFAULT_BAUD
    });
    let timeout = Duration::from_millis(u64::from(timeout_ds.max(1)) * 100);

    let port = serialport::new(path, speed)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(timeout)
        .open()
        .map_err(|e| {
            let cause = open_cause(e.kind());
            report_open_failure(path, cause, &e.description);
            Error::from(ErrorKind::Transport(cause, path.to_string()))
        })?;

    if purge {
        port.clear(ClearBuffer::All)
            .map_err(|e| ErrorKind::Transport(TransportCause::Other, e.description))?;
    }

    Ok(SerialTransport { port })
}

impl Transport for SerialTransport {
    fn recv(&mut self, buf: &mut [u8]) -> error::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn recv_until(&mut self, buf: &mut [u8], eol: u8) -> error::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.recv(&mut buf[total..total + 1])?;
            if n == 0 {
                break;
            }
            total += n;
            if buf[total - 1] == eol {
                break;
            }
        }
        Ok(total)
    }

    fn write_all(&mut self, buf: &[u8]) -> error::Result<()> {
        self.port.write_all(buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_recognized_bauds() {
        assert_eq!(recognized_baud(0), Some(DEFAULT_BAUD));
        assert_eq!(recognized_baud(115_200), Some(115_200));
        assert_eq!(recognized_baud(19200), Some(19200));
        // leaves the port at its default speed, with a warning
        assert_eq!(recognized_baud(9600), None);
        assert_eq!(recognized_baud(3_000_000), None);
    }

    #[test]
    fn test_open_causes_are_distinguishable() {
        assert_eq!(
            open_cause(serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied)),
            TransportCause::PermissionDenied
        );
        assert_eq!(
            open_cause(serialport::ErrorKind::NoDevice),
            TransportCause::NotFound
        );
        assert_eq!(
            open_cause(serialport::ErrorKind::Io(io::ErrorKind::NotFound)),
            TransportCause::NotFound
        );
        assert_eq!(
            open_cause(serialport::ErrorKind::Io(io::ErrorKind::AddrInUse)),
            TransportCause::Busy
        );
        assert_eq!(
            open_cause(serialport::ErrorKind::Unknown),
            TransportCause::Other
        );
    }

    #[test]
    fn test_open_missing_device_reports_cause() {
        let result = open("/dev/sfminer-does-not-exist", 115_200, 10, false);
        match result {
            Err(e) => match e.kind() {
                ErrorKind::Transport(cause, _) => assert_ne!(cause, TransportCause::Busy),
                other => panic!("unexpected error kind: {:?}", other),
            },
            Ok(_) => panic!("open of a nonexistent device succeeded"),
        }
    }
}

//! Synchronous AT command framing over an async byte stream
//!
//! The serial channel is half-duplex: one command goes out, and lines come
//! back until a terminal token (`OK`, `ERROR`, or a vendor error code). The
//! transport owns all timeout logic and line classification; callers see the
//! collected response lines or a classified [`AtError`].
//!
//! Reads happen in short slices so the transport can tell a link that has gone
//! completely silent (`Disconnected`) from a device that produced some bytes
//! and then stalled (`Timeout`) — the two call for different recovery.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

use crate::error::AtError;

/// Response terminator for a successful command.
const TOKEN_OK: &str = "OK";
/// Response terminator for a failed command.
const TOKEN_ERROR: &str = "ERROR";
/// Vendor error prefixes that fail a command without a terminator:
/// extended (`CME`) and SMS-subsystem (`CMS`) error reports.
const DEVICE_ERROR_PREFIXES: [&str; 2] = ["+CME ERROR:", "+CMS ERROR:"];

/// Granularity of the read loop; also the pacing for quiet slices.
const READ_SLICE: Duration = Duration::from_millis(50);
/// Read buffer size per slice; AT responses are short lines.
const READ_CHUNK: usize = 256;
/// Fixed timeout for the liveness ping.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Serial Port
// ----------------------------------------------------------------------------

/// Open a serial port as an async byte stream.
pub fn open_serial(path: &str, baud_rate: u32) -> Result<SerialStream, tokio_serial::Error> {
    let mut port = tokio_serial::new(path, baud_rate).open_native_async()?;
    #[cfg(unix)]
    port.set_exclusive(false)?;
    Ok(port)
}

// ----------------------------------------------------------------------------
// AT Transport
// ----------------------------------------------------------------------------

/// Command/response framing over any async byte stream.
///
/// `&mut self` on every exchange keeps the half-duplex invariant: a second
/// command cannot start until the first one resolved.
pub struct AtTransport<P> {
    port: P,
    timeout: Duration,
}

impl<P: AsyncRead + AsyncWrite + Unpin> AtTransport<P> {
    /// Wrap a byte stream with a default per-command timeout.
    pub fn new(port: P, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Send a command and collect its response lines.
    pub async fn command(&mut self, command: &str) -> Result<Vec<String>, AtError> {
        self.command_with_timeout(command, self.timeout).await
    }

    /// Send a command with a custom timeout.
    ///
    /// Returns all non-terminal, non-echo lines in arrival order on `OK`.
    /// Error lines short-circuit; a silent link classifies as `Disconnected`
    /// if nothing at all arrived, `Timeout` if data stopped midway.
    pub async fn command_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, AtError> {
        trace!(command, "sending AT command");
        let frame = format!("{command}\r\n");
        self.port
            .write_all(frame.as_bytes())
            .await
            .map_err(AtError::WriteFailed)?;
        self.port.flush().await.map_err(AtError::WriteFailed)?;

        let deadline = Instant::now() + timeout;
        // Quiet slices tolerated before giving up on the device, scaled to
        // the timeout with a floor of one slice.
        let max_idle_slices = (timeout.as_millis() / READ_SLICE.as_millis()).max(1);
        let mut idle_slices = 0;
        let mut received_any = false;

        let mut lines: Vec<String> = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        while Instant::now() < deadline {
            let outcome = time::timeout(READ_SLICE, self.port.read(&mut chunk)).await;
            let read = match outcome {
                // Nothing arrived within the slice.
                Err(_) => None,
                // EOF or a read error: pace like a quiet slice and let the
                // idle budget classify the failure.
                Ok(Ok(0)) | Ok(Err(_)) => {
                    time::sleep(READ_SLICE).await;
                    None
                }
                Ok(Ok(n)) => Some(n),
            };

            let Some(n) = read else {
                idle_slices += 1;
                if idle_slices > max_idle_slices {
                    return Err(if received_any {
                        AtError::Timeout("response stalled before a terminator".to_string())
                    } else {
                        AtError::Disconnected
                    });
                }
                continue;
            };

            idle_slices = 0;
            received_any = true;
            pending.extend_from_slice(&chunk[..n]);

            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();

                // Echo of our own command and blank separators carry nothing.
                if line.is_empty() || line == command {
                    continue;
                }
                if line == TOKEN_OK {
                    debug!(command, lines = lines.len(), "AT command ok");
                    return Ok(lines);
                }
                if line == TOKEN_ERROR
                    || DEVICE_ERROR_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
                {
                    debug!(command, %line, "AT command failed");
                    return Err(AtError::Device { line });
                }
                lines.push(line);
            }
        }

        if !received_any {
            Err(AtError::Disconnected)
        } else if lines.is_empty() {
            Err(AtError::Timeout("no terminator before the deadline".to_string()))
        } else {
            Err(AtError::Timeout(format!(
                "got {} response lines but no OK",
                lines.len()
            )))
        }
    }

    /// Minimal liveness probe with a short fixed timeout.
    pub async fn ping(&mut self) -> Result<(), AtError> {
        self.command_with_timeout("AT", PING_TIMEOUT).await.map(|_| ())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

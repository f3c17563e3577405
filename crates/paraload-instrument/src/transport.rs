//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Link establishment and newline-framed byte transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};
use tracing::{debug, warn};

/// Errors raised while talking to an instrument link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },
    #[error("timed out opening {endpoint} after {timeout:?}")]
    OpenTimeout { endpoint: String, timeout: Duration },
    #[error("{0} link is not open")]
    NotOpen(String),
    #[error("write to {unit} failed: {source}")]
    Write {
        unit: String,
        #[source]
        source: io::Error,
    },
    #[error("write to {unit} timed out after {timeout:?}")]
    WriteTimeout { unit: String, timeout: Duration },
}

/// Creates the byte stream behind an instrument controller.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Human readable endpoint, e.g. the serial port path.
    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<Self::Stream, TransportError>;
}

/// Opens a serial port at the configured baud rate, 8N1, no flow control.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Stream = SerialStream;

    fn endpoint(&self) -> &str {
        &self.port
    }

    async fn connect(&self) -> Result<SerialStream, TransportError> {
        let stream = tokio_serial::new(self.port.as_str(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|err| TransportError::Open {
                endpoint: self.port.clone(),
                reason: err.to_string(),
            })?;
        // give the adapter a moment before discarding whatever it buffered
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Err(err) = stream.clear(ClearBuffer::All) {
            warn!(port = %self.port, error = %err, "unable to clear stale serial buffers");
        }
        debug!(port = %self.port, baud = self.baud_rate, "serial port opened");
        Ok(stream)
    }
}

const LINE_FEED: u8 = 0x0A;

/// Newline-framed stream with an owned read buffer.
///
/// `read_line` only ever appends to the buffer, so a read abandoned by a timeout keeps
/// its partial bytes for the next call.
pub struct LineChannel<S> {
    io_handle: S,
    read_buf: Vec<u8>,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io_handle: S) -> Self {
        Self {
            io_handle,
            read_buf: Vec::with_capacity(128),
        }
    }

    fn find_line_ending(&self, start_hint: usize) -> Option<usize> {
        self.read_buf
            .get(start_hint..)?
            .iter()
            .position(|byte| *byte == LINE_FEED)
            .map(|offset| start_hint + offset)
    }

    /// Write `text` followed by a line feed.
    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut framed = Vec::with_capacity(text.len() + 1);
        framed.extend_from_slice(text.as_bytes());
        framed.push(LINE_FEED);
        self.io_handle.write_all(&framed).await?;
        self.io_handle.flush().await
    }

    /// Read one line, without its terminator. `Ok(None)` means the peer closed the link.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut scanned = 0;
        let end = loop {
            if let Some(index) = self.find_line_ending(scanned) {
                break index;
            }
            scanned = self.read_buf.len();
            let mut temp_buf = [0u8; 64];
            let bytes_read = self.io_handle.read(&mut temp_buf[..]).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&temp_buf[..bytes_read]);
        };
        let line: Vec<u8> = self.read_buf.drain(..=end).collect();
        Ok(Some(String::from_utf8_lossy(&line).trim().to_owned()))
    }

    /// Forget anything received but not yet consumed.
    pub fn discard_buffered(&mut self) {
        self.read_buf.clear();
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.io_handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_lines_across_partial_reads() {
        let (near, mut far) = duplex(64);
        let mut channel = LineChannel::new(near);

        far.write_all(b"199.").await.unwrap();
        far.write_all(b"5\r\n12").await.unwrap();
        far.write_all(b"0\n").await.unwrap();

        assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("199.5"));
        assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("120"));
    }

    #[tokio::test]
    async fn reports_peer_close() {
        let (near, far) = duplex(64);
        let mut channel = LineChannel::new(near);
        drop(far);
        assert!(channel.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_line_appends_terminator() {
        let (near, mut far) = duplex(64);
        let mut channel = LineChannel::new(near);
        channel.write_line("SYST:REM").await.unwrap();
        let mut buf = [0u8; 9];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SYST:REM\n");
    }
}

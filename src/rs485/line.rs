use crate::prelude::*;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::FutureExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

/// Read attempts per drain call; bounds the work done in one tick.
const MAX_READS_PER_DRAIN: usize = 8;

/// The half-duplex serial boundary the transport talks to.
#[async_trait]
pub trait SerialLine: Send {
    /// Asserts (`true`) or releases the transceiver's driver-enable line.
    fn set_driver(&mut self, transmit: bool) -> Result<()>;

    /// Writes a whole frame and waits until it has left the port.
    async fn transmit(&mut self, frame: &[u8]) -> Result<()>;

    /// Appends whatever bytes are available right now, without waiting.
    fn drain(&mut self, buf: &mut BytesMut) -> Result<usize>;
}

// {{{ Direction
/// How the transceiver's DE/RE pins are driven.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Auto-direction transceiver; nothing to drive.
    #[default]
    None,
    /// RTS high while transmitting.
    Rts,
    /// RTS low while transmitting.
    RtsInverted,
}

impl Direction {
    fn level(self, transmit: bool) -> Option<bool> {
        match self {
            Self::None => None,
            Self::Rts => Some(transmit),
            Self::RtsInverted => Some(!transmit),
        }
    }
}
// }}}

// {{{ SerialPortLine
pub struct SerialPortLine {
    port: String,
    stream: SerialStream,
    direction: Direction,
    baud: u32,
}

impl SerialPortLine {
    /// Opens `port` at 8N1 with no flow control.
    pub fn open(port: &str, baud: u32, direction: Direction) -> Result<Self> {
        if baud == 0 {
            return Err(file_error!("{}: baud rate must be non-zero", port));
        }

        let stream = tokio_serial::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|err| file_error_with_source!(err, "failed to open serial port {}", port))?;

        info!("opened {} at {} baud, direction {:?}", port, baud, direction);

        let mut line = Self {
            port: port.to_string(),
            stream,
            direction,
            baud,
        };
        line.set_driver(false)?;

        Ok(line)
    }

    pub fn from_config(config: &config::SerialPort) -> Result<Self> {
        Self::open(config.port(), config.baud(), config.direction())
    }

    /// Time for `len` bytes to clock out at 10 bits per byte.
    fn wire_time(&self, len: usize) -> Duration {
        Duration::from_micros(len as u64 * 10 * 1_000_000 / self.baud as u64)
    }
}

#[async_trait]
impl SerialLine for SerialPortLine {
    fn set_driver(&mut self, transmit: bool) -> Result<()> {
        if let Some(level) = self.direction.level(transmit) {
            self.stream
                .write_request_to_send(level)
                .map_err(|err| file_error_with_source!(err, "{}: RTS control failed", self.port))?;
        }
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        self.stream
            .write_all(frame)
            .await
            .map_err(|err| file_error_with_source!(err, "{}: write failed", self.port))?;
        self.stream
            .flush()
            .await
            .map_err(|err| file_error_with_source!(err, "{}: flush failed", self.port))?;

        // flush only empties our side; the UART may still be shifting bits out
        if self.direction != Direction::None {
            tokio::time::sleep(self.wire_time(frame.len())).await;
        }

        Ok(())
    }

    fn drain(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_READS_PER_DRAIN {
            match self.stream.read_buf(buf).now_or_never() {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => total += n,
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(err)) => {
                    return Err(file_error_with_source!(err, "{}: read failed", self.port))
                }
            }
        }
        Ok(total)
    }
}
// }}}

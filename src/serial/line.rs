//! Async serial transport with IEC 62056-21 line settings.
//!
//! Opens 7E1 as the standard requires. Pseudo-terminal bridges reject the
//! seven-bit configuration, in which case the port is reopened as 8N1: the
//! wire bytes are 7-bit ASCII either way, so the content is unaffected.

use std::time::Duration;

use serialport::SerialPort;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::{Error, Result};

/// Reaction time floor before each transmission. The standard permits
/// 20 ms when the manufacturer's third identification letter is lowercase,
/// which holds for the ME162.
pub const PRE_SEND_DELAY: Duration = Duration::from_millis(20);

/// Bits on the wire per byte: 1 start + 7 data + 1 parity + 1 stop.
pub const BITS_PER_BYTE: u64 = 10;

/// A serial device opened for one exclusive session.
pub struct SerialLine {
    stream: SerialStream,
    baud: u32,
}

impl SerialLine {
    /// Open the device at the given baud rate, 7E1 with an 8N1 fallback.
    pub async fn open(path: &str, baud: u32) -> Result<Self> {
        let stream = match tokio_serial::new(path, baud)
            .data_bits(DataBits::Seven)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .open_native_async()
        {
            Ok(stream) => stream,
            Err(e) => {
                log::info!(
                    "7E1 rejected on {} ({}); assuming software serial bridge, using 8N1",
                    path,
                    e
                );
                tokio_serial::new(path, baud)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .open_native_async()?
            }
        };
        Ok(Self { stream, baud })
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Change the line speed mid-session, as the mode C handshake demands.
    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.stream.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    /// Read a single byte; end-of-stream means the peer hung up.
    pub async fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte).await {
            Ok(0) => Err(Error::Hangup),
            Ok(_) => Ok(byte[0]),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a whole message, honouring the reaction-time floor up front
    /// and sleeping for the transmission time afterwards. The drain sleep
    /// keeps cooperative pseudo-terminal peers in step; real UARTs just
    /// see a small gap.
    pub async fn send(&mut self, msg: &[u8]) -> Result<()> {
        sleep(PRE_SEND_DELAY).await;
        self.stream.write_all(msg).await?;
        self.stream.flush().await?;

        let drain =
            Duration::from_secs_f64(msg.len() as f64 * BITS_PER_BYTE as f64 / self.baud as f64);
        sleep(drain).await;
        Ok(())
    }
}

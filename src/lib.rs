//! Polling client for IEC 62056-21 mode C electricity meters (ISKRA ME162
//! and friends), plus a matching test server and a pseudo-terminal serial
//! proxy so the whole stack can be exercised without meter hardware.
//!
//! The client drives the meter through the mode C handshake, switches baud
//! rate mid-session, reads the data readout and individual OBIS registers,
//! and feeds consecutive energy-counter samples into a power gauge whose
//! estimates are published over MQTT.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use thiserror::Error;

pub mod config;
pub mod gauge;
pub mod iec62056;
pub mod obis;
pub mod processor;
pub mod publish;
pub mod serial;

/// Everything that can go wrong between the serial line and the broker.
///
/// Frame-level errors (`MalformedFrame`, `BccMismatch`) are recoverable with
/// a NAK; state-level errors (`Timeout`, `ProtocolDesync`) fall back to an
/// earlier protocol state; the rest tear the session down and leave the
/// restart to the surrounding supervisor.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("BCC mismatch: computed {computed:#04x}, received {received:#04x}")]
    BccMismatch { computed: u8, received: u8 },

    #[error("unsupported OBIS code {0:?}")]
    UnsupportedObis(String),

    #[error("unit {given:?} does not match expected {expected:?}")]
    UnitMismatch { given: String, expected: &'static str },

    #[error("protocol desync in {state}: {detail}")]
    ProtocolDesync { state: &'static str, detail: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("dead man's switch tripped: {0} ms without a register update")]
    DeadMansSwitchTripped(i64),

    #[error("peer hung up")]
    Hangup,

    #[error("proxy child exited with status {0}")]
    ChildExited(i32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

#[cfg(unix)]
impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

static CLOCK_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on a process-local monotonic clock.
///
/// The gauges and the dead man's switch only ever look at differences, so
/// the epoch is arbitrary; a monotonic base avoids wall-clock jumps.
pub fn now_ms() -> i64 {
    CLOCK_START.elapsed().as_millis() as i64
}

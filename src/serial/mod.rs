//! Serial plumbing: the async transport used by the protocol client and
//! the pseudo-terminal proxy used to test without meter hardware.

pub mod line;
#[cfg(unix)]
pub mod proxy;

pub use line::SerialLine;
#[cfg(unix)]
pub use proxy::SerialProxy;

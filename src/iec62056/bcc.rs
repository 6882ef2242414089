//! Block check character (BCC) codec, DIN 66219 flavour.
//!
//! The BCC is the XOR of every byte strictly after the opening SOH/STX up
//! to and including the terminating ETX/EOT. Noise bytes before the opener
//! are permitted and excluded from the checksum.

use crate::iec62056::control;
use crate::{Error, Result};

/// XOR fold over a byte slice. The caller picks the range.
pub fn xor_bcc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Append the BCC to a frame of the shape `[prefix] OPENER payload CLOSER`.
///
/// The frame must contain an opener and must end with the closer as its
/// final byte; anything else is a [`Error::MalformedFrame`].
pub fn append_bcc(frame: &[u8]) -> Result<Vec<u8>> {
    let opener = frame
        .iter()
        .position(|&b| control::is_opener(b))
        .ok_or_else(|| Error::MalformedFrame(format!("no SOH/STX in {:?}", frame)))?;
    match frame.last() {
        Some(&last) if control::is_closer(last) => {}
        _ => {
            return Err(Error::MalformedFrame(format!(
                "expected one ETX/EOT at end of {:?}",
                frame
            )))
        }
    }

    let bcc = xor_bcc(&frame[opener + 1..]);
    let mut out = frame.to_vec();
    out.push(bcc);
    Ok(out)
}

/// Verify the BCC of a received frame `[prefix] OPENER payload CLOSER BCC`.
///
/// Fails with [`Error::MalformedFrame`] when the closer is missing or not
/// in the second-to-last position, and with [`Error::BccMismatch`] when the
/// trailing byte disagrees with the computed checksum.
pub fn check_bcc(frame: &[u8]) -> Result<()> {
    let opener = frame
        .iter()
        .position(|&b| control::is_opener(b))
        .ok_or_else(|| Error::MalformedFrame(format!("no SOH/STX in {:?}", frame)))?;
    let closer = frame[opener + 1..]
        .iter()
        .position(|&b| control::is_closer(b))
        .map(|rel| opener + 1 + rel)
        .ok_or_else(|| Error::MalformedFrame(format!("no ETX/EOT in {:?}", frame)))?;

    if closer + 2 != frame.len() {
        return Err(Error::MalformedFrame(format!(
            "expected BCC right after ETX/EOT in {:?}",
            frame
        )));
    }

    let computed = xor_bcc(&frame[opener + 1..=closer]);
    let received = frame[closer + 1];
    if computed != received {
        return Err(Error::BccMismatch { computed, received });
    }
    Ok(())
}

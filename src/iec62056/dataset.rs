//! Dataset and datamessage parsing.
//!
//! A dataset is `address? "(" value? ("*" unit)? ")"`. Datamessages wrap
//! one dataset (programming mode) or a whole datablock terminated by
//! `"!" CR LF` (readout mode) in `STX ... ETX BCC` framing.

use crate::iec62056::{bcc, control};
use crate::{Error, Result};

/// One `address(value*unit)` triple. The value stays textual here; unit
/// normalisation happens when it is applied to an OBIS register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub address: String,
    pub value: String,
    pub unit: Option<String>,
}

/// Parse a single dataset like `1.8.0(0034204.753*kWh)` or `()`.
pub fn parse_dataset(dataset: &str) -> Result<Dataset> {
    let malformed = || Error::MalformedFrame(format!("error parsing dataset {:?}", dataset));

    let (address, rest) = dataset.split_once('(').ok_or_else(malformed)?;
    let body = rest.strip_suffix(')').ok_or_else(malformed)?;
    if body.contains('(') || body.contains(')') {
        return Err(malformed());
    }

    let (value, unit) = match body.split_once('*') {
        Some((value, unit)) => (value.to_string(), Some(unit.to_string())),
        None => (body.to_string(), None),
    };

    Ok(Dataset {
        address: address.to_string(),
        value,
        unit,
    })
}

/// Verify the BCC of a datamessage and return the text between the opener
/// and the closer, decoded as 7-bit ASCII.
pub fn unpack_datamessage(frame: &[u8]) -> Result<String> {
    bcc::check_bcc(frame)?;

    let opener = frame
        .iter()
        .position(|&b| control::is_opener(b))
        .ok_or_else(|| Error::MalformedFrame(format!("no SOH/STX in {:?}", frame)))?;
    let payload = &frame[opener + 1..frame.len() - 2];

    if payload.iter().any(|&b| b >= 0x80) {
        return Err(Error::MalformedFrame(format!(
            "non-ASCII byte in datamessage {:?}",
            frame
        )));
    }
    Ok(payload.iter().map(|&b| b as char).collect())
}

/// Split an unpacked readout datablock (`dataset CRLF ... "!" CRLF`) into
/// its dataset lines.
pub fn split_readout(datablock: &str) -> Result<Vec<&str>> {
    let body = datablock.strip_suffix("\r\n!\r\n").ok_or_else(|| {
        Error::MalformedFrame(format!("readout without end marker: {:?}", datablock))
    })?;
    Ok(body.split("\r\n").collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_with_unit() {
        let ds = parse_dataset("1.8.0(0034204.753*kWh)").unwrap();
        assert_eq!(ds.address, "1.8.0");
        assert_eq!(ds.value, "0034204.753");
        assert_eq!(ds.unit.as_deref(), Some("kWh"));
    }

    #[test]
    fn test_parse_dataset_without_unit() {
        let ds = parse_dataset("C.1.0(12345678)").unwrap();
        assert_eq!(ds.address, "C.1.0");
        assert_eq!(ds.value, "12345678");
        assert_eq!(ds.unit, None);
    }

    #[test]
    fn test_parse_dataset_empty() {
        let ds = parse_dataset("()").unwrap();
        assert_eq!(ds.address, "");
        assert_eq!(ds.value, "");
        assert_eq!(ds.unit, None);
    }

    #[test]
    fn test_parse_dataset_malformed() {
        assert!(parse_dataset("1.8.0").is_err());
        assert!(parse_dataset("1.8.0(123").is_err());
        assert!(parse_dataset("1.8.0(123)x").is_err());
    }

    #[test]
    fn test_unpack_datamessage() {
        let frame = bcc::append_bcc(b"\x02(0033402.264*kWh)\x03").unwrap();
        assert_eq!(unpack_datamessage(&frame).unwrap(), "(0033402.264*kWh)");
    }

    #[test]
    fn test_unpack_datamessage_bad_bcc() {
        let mut frame = bcc::append_bcc(b"\x02(0033402.264*kWh)\x03").unwrap();
        *frame.last_mut().unwrap() ^= 0x01;
        assert!(matches!(
            unpack_datamessage(&frame),
            Err(Error::BccMismatch { .. })
        ));
    }

    #[test]
    fn test_split_readout() {
        let block = "C.1.0(12345678)\r\n1.8.0(0034204.753*kWh)\r\n!\r\n";
        let lines = split_readout(block).unwrap();
        assert_eq!(lines, vec!["C.1.0(12345678)", "1.8.0(0034204.753*kWh)"]);
    }

    #[test]
    fn test_split_readout_without_marker() {
        assert!(split_readout("1.8.0(1*kWh)\r\n").is_err());
    }
}

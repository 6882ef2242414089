//! OBIS (Object Identification System) codes and values.
//!
//! Full OBIS identifiers look like `A-B:C.D.E*F`. The ME162 speaks the
//! abbreviated electricity form, so only `C.D.E` with an optional `*F`
//! billing-period tail is handled here. Codes are classified on `(C, D)`
//! into active energy (D=8, unit Wh), instantaneous power (D=7, unit W)
//! and a small set of miscellaneous registers without a fixed unit.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use crate::{Error, Result};

/// Classification of a recognised code, which also fixes the canonical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObisKind {
    /// `1.8.x`, `2.8.x`, `15.8.x`, `16.8.x`: watt hour counters.
    ActiveEnergy,
    /// `1.7.0`, `2.7.0`, `15.7.0`, `16.7.0`: watt readings.
    InstantaneousPower,
    /// Serial number, status words, clock: no unit attached.
    Misc,
}

impl ObisKind {
    /// Canonical unit for values of this kind, if there is one.
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            ObisKind::ActiveEnergy => Some("Wh"),
            ObisKind::InstantaneousPower => Some("W"),
            ObisKind::Misc => None,
        }
    }
}

/// A register value after unit normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum ObisValue {
    /// Nothing stored yet.
    None,
    /// Unit-less registers keep their text verbatim (serial numbers may
    /// carry leading zeros or hex digits).
    Raw(String),
    /// Numeric value in the canonical unit of the code.
    Quantity { value: f64, unit: &'static str },
}

impl fmt::Display for ObisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObisValue::None => write!(f, "(none)"),
            ObisValue::Raw(s) => write!(f, "{}", s),
            ObisValue::Quantity { value, unit } => {
                if value.fract() == 0.0 {
                    write!(f, "{:.0} {}", value, unit)
                } else {
                    write!(f, "{} {}", value, unit)
                }
            }
        }
    }
}

/// A parsed electricity OBIS code with an optional value.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectricityObis {
    code: String,
    kind: ObisKind,
    description: String,
    value: ObisValue,
}

impl ElectricityObis {
    /// Parse a `C.D.E[*F]` code. `"F.F"` is the ME162 spelling of the
    /// error register and normalises to `"F.F.0"`.
    pub fn from_code(code: &str) -> Result<Self> {
        let code = if code == "F.F" { "F.F.0" } else { code };
        let unsupported = || Error::UnsupportedObis(code.to_string());

        let mut parts = code.split('.');
        let (c, d, e) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(d), Some(e), None) => (c, d, e),
            _ => return Err(unsupported()),
        };
        let (e, f) = match e.split_once('*') {
            Some((e, f)) => {
                let f: u8 = f.parse().map_err(|_| unsupported())?;
                (e, Some(f))
            }
            None => (e, None),
        };

        let c_num: Option<u32> = c.parse().ok();
        let d_num: Option<u32> = d.parse().ok();
        let e_num: Option<u32> = e.parse().ok();

        let canonical = match f {
            Some(f) => format!("{}.{}.{}*{}", c, d, e, f),
            None => format!("{}.{}.{}", c, d, e),
        };

        let (kind, description) = match (c_num, d_num, e_num) {
            (Some(c @ (1 | 2 | 15 | 16)), Some(8), Some(e)) => {
                let tariff = if e > 0 {
                    format!("in T{}", e)
                } else {
                    "total".to_string()
                };
                let description = match c {
                    1 => format!("Positive active energy (A+) {}", tariff),
                    2 => format!("Negative active energy (A-) {}", tariff),
                    15 => format!("Absolute active energy (|A|) {}", tariff),
                    _ => format!("Sum active energy without reverse blockade {}", tariff),
                };
                (ObisKind::ActiveEnergy, description)
            }
            (Some(c @ (1 | 2 | 15 | 16)), Some(7), Some(0)) => {
                let description = match c {
                    1 => "Positive active instantaneous power (A+)",
                    2 => "Negative active instantaneous power (A-)",
                    15 => "Absolute active instantaneous power (|A|)",
                    _ => "Sum active instantaneous power (A+ - A-)",
                };
                (ObisKind::InstantaneousPower, description.to_string())
            }
            _ if f.is_none() && (c_num == Some(0) || canonical == "C.1.0" || canonical == "F.F.0") => {
                let description = match canonical.as_str() {
                    "C.1.0" => "Meter serial number",
                    "F.F.0" => "Fatal error meter status",
                    "0.9.1" => "Time (hh:mm:ss)",
                    "0.9.2" => "Date (YY.MM.DD)",
                    _ => "Device register",
                };
                (ObisKind::Misc, description.to_string())
            }
            _ => return Err(unsupported()),
        };

        Ok(Self {
            code: canonical,
            kind,
            description,
            value: ObisValue::None,
        })
    }

    /// Store a value, normalising the unit.
    ///
    /// Accepted units: none, the canonical unit of the code, or the
    /// kilo-prefixed canonical unit. Kilo values are multiplied by 1000 and
    /// truncated to an integral count; the extra decimals carry no
    /// information at watt-hour resolution.
    pub fn set_value(mut self, raw: &str, unit: Option<&str>) -> Result<Self> {
        let code = self.code.clone();
        let parse = move |raw: &str| -> Result<f64> {
            raw.trim().parse::<f64>().map_err(|_| {
                Error::MalformedFrame(format!("unparseable value {:?} for {}", raw, code))
            })
        };

        self.value = match (unit, self.kind.unit()) {
            (None, Some(canonical)) => match raw.trim().parse::<f64>() {
                Ok(value) => ObisValue::Quantity { value, unit: canonical },
                Err(_) => ObisValue::Raw(raw.to_string()),
            },
            (None, None) => ObisValue::Raw(raw.to_string()),
            (Some(given), Some(canonical)) if given == canonical => ObisValue::Quantity {
                value: parse(raw)?,
                unit: canonical,
            },
            (Some(given), Some(canonical))
                if given.strip_prefix('k') == Some(canonical) =>
            {
                // Scale textually; going through a float here can land
                // one unit low ("34204.753" * 1000 is 34204752.999...).
                let value = scale_by_1000(raw).ok_or_else(|| {
                    Error::MalformedFrame(format!(
                        "unparseable value {:?} for {}",
                        raw, self.code
                    ))
                })?;
                ObisValue::Quantity {
                    value,
                    unit: canonical,
                }
            }
            (Some(given), expected) => {
                return Err(Error::UnitMismatch {
                    given: given.to_string(),
                    expected: expected.unwrap_or("(none)"),
                })
            }
        };
        Ok(self)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn kind(&self) -> ObisKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn unit(&self) -> Option<&'static str> {
        self.kind.unit()
    }

    pub fn value(&self) -> &ObisValue {
        &self.value
    }

    /// Integral value in the canonical unit, for the gauges.
    pub fn integral_value(&self) -> Option<i64> {
        match self.value {
            ObisValue::Quantity { value, .. } => Some(value.trunc() as i64),
            _ => None,
        }
    }
}

impl fmt::Display for ElectricityObis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.code, self.value)
    }
}

/// Multiply a decimal string by 1000, truncating to an integral value:
/// shift the decimal point three digits instead of doing float
/// arithmetic, so counter values survive exactly.
fn scale_by_1000(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let frac3: String = frac_part.chars().chain(std::iter::repeat('0')).take(3).collect();
    let combined = format!("{}{}", int_part, frac3);
    let value: i64 = combined.parse().ok()?;
    Some(if negative { -value as f64 } else { value as f64 })
}

/// ME162 register dictionary, kept as reference data for log output and
/// for deciding what to poll.
pub static OBIS_DICTIONARY: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("1.8.0", "Positive active energy (A+) total [Wh]"),
        ("2.8.0", "Negative active energy (A-) total [Wh]"),
        ("1.8.1", "Positive active energy (A+) in tariff T1 [Wh]"),
        ("1.8.2", "Positive active energy (A+) in tariff T2 [Wh]"),
        ("1.8.3", "Positive active energy (A+) in tariff T3 [Wh]"),
        ("1.8.4", "Positive active energy (A+) in tariff T4 [Wh]"),
        ("2.8.1", "Negative active energy (A-) in tariff T1 [Wh]"),
        ("2.8.2", "Negative active energy (A-) in tariff T2 [Wh]"),
        ("15.8.0", "Total absolute active energy (= 1.8.0 + 2.8.0) [Wh]"),
        ("C.1.0", "Meter serial number"),
        ("F.F", "Fatal error meter status"),
        ("0.9.1", "Time (returns hh:mm:ss)"),
        ("0.9.2", "Date (returns YY.MM.DD)"),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_energy() {
        let obis = ElectricityObis::from_code("1.8.0").unwrap();
        assert_eq!(obis.code(), "1.8.0");
        assert_eq!(obis.unit(), Some("Wh"));
        assert_eq!(obis.description(), "Positive active energy (A+) total");

        let obis = ElectricityObis::from_code("2.8.4").unwrap();
        assert_eq!(obis.unit(), Some("Wh"));
        assert_eq!(obis.description(), "Negative active energy (A-) in T4");
    }

    #[test]
    fn test_instantaneous_power() {
        let obis = ElectricityObis::from_code("16.7.0").unwrap();
        assert_eq!(obis.code(), "16.7.0");
        assert_eq!(obis.unit(), Some("W"));
        assert_eq!(obis.description(), "Sum active instantaneous power (A+ - A-)");
    }

    #[test]
    fn test_ff_normalisation() {
        let obis = ElectricityObis::from_code("F.F").unwrap();
        assert_eq!(obis.code(), "F.F.0");
        assert_eq!(obis, ElectricityObis::from_code("F.F.0").unwrap());
        assert_eq!(obis.kind(), ObisKind::Misc);
    }

    #[test]
    fn test_misc_codes() {
        assert_eq!(
            ElectricityObis::from_code("C.1.0").unwrap().kind(),
            ObisKind::Misc
        );
        assert_eq!(
            ElectricityObis::from_code("0.0.0").unwrap().kind(),
            ObisKind::Misc
        );
        assert_eq!(
            ElectricityObis::from_code("0.9.1").unwrap().kind(),
            ObisKind::Misc
        );
    }

    #[test]
    fn test_unknown_codes() {
        assert!(matches!(
            ElectricityObis::from_code("99.99.99"),
            Err(Error::UnsupportedObis(_))
        ));
        assert!(matches!(
            ElectricityObis::from_code("garbage"),
            Err(Error::UnsupportedObis(_))
        ));
        // Power registers only exist with E = 0.
        assert!(matches!(
            ElectricityObis::from_code("1.7.5"),
            Err(Error::UnsupportedObis(_))
        ));
    }

    #[test]
    fn test_billing_period_tail() {
        let obis = ElectricityObis::from_code("1.8.0*08").unwrap();
        assert_eq!(obis.code(), "1.8.0*8");
        assert_eq!(obis.kind(), ObisKind::ActiveEnergy);
    }

    #[test]
    fn test_kilo_normalisation() {
        let obis = ElectricityObis::from_code("1.8.0")
            .unwrap()
            .set_value("1234", Some("kWh"))
            .unwrap();
        assert_eq!(obis.integral_value(), Some(1_234_000));
        assert_eq!(obis.value().to_string(), "1234000 Wh");
        assert_eq!(format!("{}", obis), "1.8.0(1234000 Wh)");
    }

    #[test]
    fn test_exact_unit() {
        let obis = ElectricityObis::from_code("16.7.0")
            .unwrap()
            .set_value("1234", Some("W"))
            .unwrap();
        assert_eq!(obis.integral_value(), Some(1234));
    }

    #[test]
    fn test_unit_mismatch() {
        assert!(matches!(
            ElectricityObis::from_code("1.7.0")
                .unwrap()
                .set_value("1234", Some("kWh")),
            Err(Error::UnitMismatch { expected: "W", .. })
        ));

        let obis = ElectricityObis::from_code("1.7.0")
            .unwrap()
            .set_value("1234", Some("kW"))
            .unwrap();
        assert_eq!(obis.value().to_string(), "1234000 W");
    }

    #[test]
    fn test_raw_value() {
        let obis = ElectricityObis::from_code("C.1.0")
            .unwrap()
            .set_value("12345678", None)
            .unwrap();
        assert_eq!(obis.value(), &ObisValue::Raw("12345678".to_string()));
        assert_eq!(obis.integral_value(), None);
    }

    #[test]
    fn test_decimal_kwh() {
        let obis = ElectricityObis::from_code("1.8.0")
            .unwrap()
            .set_value("0033402.264", Some("kWh"))
            .unwrap();
        assert_eq!(obis.integral_value(), Some(33_402_264));

        // Values whose binary float representation rounds down must still
        // scale exactly.
        let obis = ElectricityObis::from_code("1.8.0")
            .unwrap()
            .set_value("0034204.753", Some("kWh"))
            .unwrap();
        assert_eq!(obis.integral_value(), Some(34_204_753));
    }

    #[test]
    fn test_scale_by_1000() {
        assert_eq!(scale_by_1000("1234"), Some(1_234_000.0));
        assert_eq!(scale_by_1000("0.5"), Some(500.0));
        assert_eq!(scale_by_1000(".5"), Some(500.0));
        assert_eq!(scale_by_1000("1.23456"), Some(1_234.0));
        assert_eq!(scale_by_1000("-2.5"), Some(-2_500.0));
        assert_eq!(scale_by_1000("ERROR"), None);
        assert_eq!(scale_by_1000(""), None);
    }

    #[test]
    fn test_dictionary() {
        assert!(OBIS_DICTIONARY.contains_key("1.8.0"));
        assert!(OBIS_DICTIONARY.contains_key("2.8.0"));
    }
}

//! Register value decoding

use std::fmt;

use super::ReadError;
use crate::registers::{Register, RegisterType};

/// Big-endian bytes of one successful register read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRegisterValue {
    bytes: Vec<u8>,
}

impl RawRegisterValue {
    pub fn from_words(words: &[u16]) -> Self {
        Self {
            bytes: words.iter().flat_map(|w| w.to_be_bytes()).collect(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of complete 16-bit words held
    pub fn word_count(&self) -> usize {
        self.bytes.len() / 2
    }

    /// The first data word, as answered to gateway clients
    pub fn first_word(&self) -> Option<u16> {
        match self.bytes.as_slice() {
            [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

/// A decoded register value, ready for display
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// Float rendered with at most 3 decimals
    Decimal(String),
    Integer(i32),
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Decimal(s) => f.write_str(s),
            DecodedValue::Integer(v) => write!(f, "{}", v),
        }
    }
}

/// Decode the first 4 bytes of `raw` according to the register's type.
///
/// Fewer than 4 bytes means the device answered short, which is reported as a
/// read failure.
pub fn decode(register: &Register, raw: &RawRegisterValue) -> Result<DecodedValue, ReadError> {
    let bytes: [u8; 4] = raw
        .as_bytes()
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(ReadError::ShortResponse {
            expected: 2,
            received: raw.word_count(),
        })?;

    Ok(match register.register_type {
        RegisterType::Float32BE => {
            DecodedValue::Decimal(format_fixed3(f32::from_be_bytes(bytes) as f64))
        }
        RegisterType::Int32BE => DecodedValue::Integer(i32::from_be_bytes(bytes)),
    })
}

/// Round to 3 decimals (ties away from zero), then drop trailing zeros and a
/// dangling decimal point.
fn format_fixed3(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    let sign = if value < 0.0 { "-" } else { "" };
    // exact for any f32 input: 24 mantissa bits times 1000 fits in an f64
    let scaled = (value.abs() * 1000.0 + 0.5).floor();
    let digits = format!("{:04.0}", scaled);
    let (int_part, frac_part) = digits.split_at(digits.len() - 3);
    let frac_part = frac_part.trim_end_matches('0');

    if frac_part.is_empty() {
        format!("{}{}", sign, int_part)
    } else {
        format!("{}{}.{}", sign, int_part, frac_part)
    }
}

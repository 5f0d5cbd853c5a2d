//! Register word decoding.
//!
//! Every supported data type is reconstructed from exactly two 16-bit
//! register words combined into a 32-bit magnitude under a configurable
//! word order.

use serde::Serialize;
use thiserror::Error;

/// Error type for decode operations.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("expected at least 2 register words, got {0}")]
    InvalidInput(usize),
}

/// Which of two 16-bit words carries the more-significant half of a
/// combined 32-bit value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WordOrder {
    /// The first word holds the high 16 bits.
    #[default]
    MsbFirst,
    /// The second word holds the high 16 bits.
    LsbFirst,
}

impl WordOrder {
    /// Parse the wire spelling used by the gauge configuration API.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "msb_first" => Some(WordOrder::MsbFirst),
            "lsb_first" => Some(WordOrder::LsbFirst),
            _ => None,
        }
    }

    /// Return the wire spelling for this word order.
    pub fn as_str(&self) -> &'static str {
        match self {
            WordOrder::MsbFirst => "msb_first",
            WordOrder::LsbFirst => "lsb_first",
        }
    }
}

/// Interpretation applied to the combined 32-bit magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 32-bit integer (two's complement).
    Int32,
    /// IEEE-754 binary32.
    Float32,
    /// IEEE-754 binary64, reconstructed from the high half only.
    Float64,
    /// Uppercase hexadecimal text with a `0x` prefix.
    Hex,
    /// Base-2 text with a `0b` prefix.
    Binary,
}

impl DataType {
    /// Parse the wire spelling used by the gauge configuration API.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "unsigned_int" => Some(DataType::Uint32),
            "signed_int" => Some(DataType::Int32),
            "float" => Some(DataType::Float32),
            "double" => Some(DataType::Float64),
            "hex" => Some(DataType::Hex),
            "binary" => Some(DataType::Binary),
            _ => None,
        }
    }

    /// Return the wire spelling for this data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Uint32 => "unsigned_int",
            DataType::Int32 => "signed_int",
            DataType::Float32 => "float",
            DataType::Float64 => "double",
            DataType::Hex => "hex",
            DataType::Binary => "binary",
        }
    }
}

/// A decoded register value.
///
/// Serializes untagged, so a payload field holding one of these renders as
/// a bare JSON number or string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Combine the first two words into a 32-bit magnitude.
fn magnitude(words: &[u16], order: WordOrder) -> u32 {
    match order {
        WordOrder::MsbFirst => ((words[0] as u32) << 16) | words[1] as u32,
        WordOrder::LsbFirst => ((words[1] as u32) << 16) | words[0] as u32,
    }
}

/// Decode a register read into a typed value.
///
/// Exactly two words are consumed; extra words are ignored and fewer than
/// two is a caller contract violation. The `Float64` path reinterprets the
/// 32-bit magnitude as the HIGH half of a 64-bit pattern whose low half is
/// zero - it is only meaningful when the two words carry the upper half of
/// a big-endian double. That restriction matches the deployed devices and
/// is deliberate; a general 64-bit decode would need four registers.
pub fn decode(
    words: &[u16],
    order: WordOrder,
    data_type: DataType,
) -> Result<DecodedValue, DecodeError> {
    if words.len() < 2 {
        return Err(DecodeError::InvalidInput(words.len()));
    }

    let magnitude = magnitude(words, order);

    let value = match data_type {
        DataType::Uint32 => DecodedValue::Integer(magnitude as i64),
        DataType::Int32 => DecodedValue::Integer(magnitude as i32 as i64),
        DataType::Float32 => DecodedValue::Float(f32::from_bits(magnitude) as f64),
        DataType::Float64 => DecodedValue::Float(f64::from_bits((magnitude as u64) << 32)),
        DataType::Hex => DecodedValue::Text(format!("0x{:X}", magnitude)),
        DataType::Binary => DecodedValue::Text(format!("0b{:b}", magnitude)),
    };

    Ok(value)
}

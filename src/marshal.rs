//! Field value marshalling between typed values and PLC words.
//!
//! Pure functions, no I/O. Four data types are supported:
//!
//! | Type | Words | Encoding |
//! |------|-------|----------|
//! | [`DataType::Real`] | 1 or 2 | `round(value × scale)` as i16, or i32 high word first |
//! | [`DataType::Ascii`] | `ceil(chars / 2)` | 2 chars per word, high byte first, NUL padded |
//! | [`DataType::Boolean`] | 1 | 0 / 1, any non-zero reads as true |
//! | [`DataType::Bcd`] | 1 | one decimal digit per nibble, 2 or 4 digits |
//!
//! # Uninitialized memory
//!
//! PLC memory that was never written reads back as all ones. Any field whose
//! words are all `0xFFFF` decodes to [`Reading::Uninitialized`], whatever its
//! type, so a 1-word REAL with scale 100 is never reported as `655.35`.
//! Values whose encoding would collide with that pattern are refused.
//!
//! # Example
//!
//! ```
//! use fins_gateway::marshal::{decode, encode, DataType, FieldValue, Reading};
//!
//! let weight = DataType::Real { scale: 100.0 };
//! let words = encode(weight, 2, &FieldValue::Real(1234.56)).unwrap();
//! assert_eq!(words, vec![0x0001, 0xE240]);
//! assert_eq!(decode(weight, &words).unwrap(), Reading::Value(FieldValue::Real(1234.56)));
//!
//! assert_eq!(decode(DataType::Real { scale: 100.0 }, &[0xFFFF]).unwrap(), Reading::Uninitialized);
//! ```

use serde::Serialize;
use thiserror::Error;

/// All-ones word written by nothing: memory the PLC never initialised.
pub const UNINITIALIZED_WORD: u16 = 0xFFFF;

/// Data type of one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataType {
    /// Fixed-point real: stored as `round(value × scale)`.
    Real {
        /// Multiplier applied before storing.
        scale: f64,
    },
    /// Packed ASCII text.
    Ascii {
        /// Declared character length.
        chars: u16,
    },
    /// Single-word boolean.
    Boolean,
    /// Binary-coded decimal.
    Bcd {
        /// 2 (low byte) or 4 (full word).
        digits: u8,
    },
}

impl DataType {
    /// Short type name used in logs and the memory map listing.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Real { .. } => "REAL",
            DataType::Ascii { .. } => "ASCII",
            DataType::Boolean => "BOOLEAN",
            DataType::Bcd { .. } => "BCD",
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Scaled real.
    Real(f64),
    /// ASCII text.
    Text(String),
    /// Boolean flag.
    Bool(bool),
    /// BCD number.
    Bcd(u16),
}

/// Result of decoding one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// The PLC holds a value.
    Value(FieldValue),
    /// The words were never written (all `0xFFFF`); there is no data.
    Uninitialized,
}

impl Reading {
    /// Returns the real value, if the reading holds one.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Reading::Value(FieldValue::Real(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if the reading holds a non-empty one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reading::Value(FieldValue::Text(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean value, if the reading holds one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Reading::Value(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Returns the BCD value, if the reading holds one.
    pub fn as_bcd(&self) -> Option<u16> {
        match self {
            Reading::Value(FieldValue::Bcd(n)) => Some(*n),
            _ => None,
        }
    }
}

/// Errors raised while marshalling one field.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalError {
    /// The value cannot be represented in the field.
    #[error("value {value} out of range for {data_type} field: {reason}")]
    OutOfRange {
        /// Offending value, formatted.
        value: String,
        /// Field data type name.
        data_type: &'static str,
        /// What limit was hit.
        reason: String,
    },

    /// The value's variant does not match the field's data type.
    #[error("type mismatch: {data_type} field cannot hold {value:?}")]
    TypeMismatch {
        /// Field data type name.
        data_type: &'static str,
        /// Offending value.
        value: FieldValue,
    },

    /// Text contains non-ASCII characters.
    #[error("text {0:?} is not ASCII")]
    NotAscii(String),

    /// A BCD word contains a nibble above 9.
    #[error("word 0x{0:04X} is not valid BCD")]
    InvalidBcd(u16),

    /// The field definition itself is unusable.
    #[error("{data_type} field cannot span {words} words")]
    BadWidth {
        /// Field data type name.
        data_type: &'static str,
        /// Declared word count.
        words: u16,
    },

    /// Fewer or more words than the field declares.
    #[error("expected {expected} words, got {actual}")]
    WordCount {
        /// Declared word count.
        expected: u16,
        /// Words supplied.
        actual: usize,
    },
}

fn out_of_range(value: impl ToString, data_type: DataType, reason: impl Into<String>) -> MarshalError {
    MarshalError::OutOfRange {
        value: value.to_string(),
        data_type: data_type.name(),
        reason: reason.into(),
    }
}

/// Encodes `value` into exactly `words` words for a field of `data_type`.
///
/// # Errors
///
/// Returns a [`MarshalError`] when the value does not fit; nothing is
/// clamped.
pub fn encode(data_type: DataType, words: u16, value: &FieldValue) -> Result<Vec<u16>, MarshalError> {
    match (data_type, value) {
        (DataType::Real { scale }, FieldValue::Real(v)) => encode_real(*v, scale, words),
        (DataType::Ascii { chars }, FieldValue::Text(s)) => encode_ascii(s, chars, words),
        (DataType::Boolean, FieldValue::Bool(b)) => {
            check_width(data_type, words, 1)?;
            Ok(vec![u16::from(*b)])
        }
        (DataType::Bcd { digits }, FieldValue::Bcd(n)) => {
            check_width(data_type, words, 1)?;
            encode_bcd(*n, digits).map(|w| vec![w])
        }
        (_, other) => Err(MarshalError::TypeMismatch {
            data_type: data_type.name(),
            value: other.clone(),
        }),
    }
}

/// Decodes the words of one field.
///
/// All-ones input yields [`Reading::Uninitialized`] for every data type.
///
/// # Errors
///
/// Returns a [`MarshalError`] for invalid BCD or non-ASCII bytes.
pub fn decode(data_type: DataType, words: &[u16]) -> Result<Reading, MarshalError> {
    if words.is_empty() {
        return Err(MarshalError::WordCount {
            expected: 1,
            actual: 0,
        });
    }
    if words.iter().all(|&w| w == UNINITIALIZED_WORD) {
        return Ok(Reading::Uninitialized);
    }

    let value = match data_type {
        DataType::Real { scale } => FieldValue::Real(decode_real(words, scale)?),
        DataType::Ascii { chars } => FieldValue::Text(decode_ascii(words, chars)?),
        DataType::Boolean => FieldValue::Bool(words[0] != 0),
        DataType::Bcd { digits } => FieldValue::Bcd(decode_bcd(words[0], digits)?),
    };
    Ok(Reading::Value(value))
}

fn check_width(data_type: DataType, words: u16, expected: u16) -> Result<(), MarshalError> {
    if words != expected {
        return Err(MarshalError::BadWidth {
            data_type: data_type.name(),
            words,
        });
    }
    Ok(())
}

fn encode_real(value: f64, scale: f64, words: u16) -> Result<Vec<u16>, MarshalError> {
    let data_type = DataType::Real { scale };
    if !value.is_finite() {
        return Err(out_of_range(value, data_type, "not a finite number"));
    }
    let raw = (value * scale).round();

    match words {
        1 => {
            if raw < f64::from(i16::MIN) || raw > f64::from(i16::MAX) {
                return Err(out_of_range(value, data_type, "exceeds 16-bit signed range"));
            }
            let word = (raw as i16) as u16;
            if word == UNINITIALIZED_WORD {
                return Err(out_of_range(value, data_type, "collides with the uninitialized pattern"));
            }
            Ok(vec![word])
        }
        2 => {
            if raw < f64::from(i32::MIN) || raw > f64::from(i32::MAX) {
                return Err(out_of_range(value, data_type, "exceeds 32-bit signed range"));
            }
            let dword = (raw as i32) as u32;
            if dword == u32::MAX {
                return Err(out_of_range(value, data_type, "collides with the uninitialized pattern"));
            }
            Ok(vec![(dword >> 16) as u16, (dword & 0xFFFF) as u16])
        }
        other => Err(MarshalError::BadWidth {
            data_type: data_type.name(),
            words: other,
        }),
    }
}

fn decode_real(words: &[u16], scale: f64) -> Result<f64, MarshalError> {
    let raw = match words {
        [w] => f64::from(*w as i16),
        [hi, lo] => f64::from(((u32::from(*hi) << 16) | u32::from(*lo)) as i32),
        other => {
            return Err(MarshalError::BadWidth {
                data_type: "REAL",
                words: other.len() as u16,
            })
        }
    };
    // Round away float noise so decode(encode(v)) == v at the field's precision.
    let decimals = scale.log10().round().max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    Ok(((raw / scale) * factor).round() / factor)
}

fn encode_ascii(text: &str, chars: u16, words: u16) -> Result<Vec<u16>, MarshalError> {
    if !text.is_ascii() {
        return Err(MarshalError::NotAscii(text.to_string()));
    }
    if (chars as usize).div_ceil(2) != words as usize {
        return Err(MarshalError::BadWidth {
            data_type: "ASCII",
            words,
        });
    }

    let mut bytes: Vec<u8> = text.bytes().take(chars as usize).collect();
    bytes.resize(words as usize * 2, 0);
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn decode_ascii(words: &[u16], chars: u16) -> Result<String, MarshalError> {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .take(chars as usize)
        .filter(|&b| b != 0)
        .collect();
    if !bytes.is_ascii() {
        return Err(MarshalError::NotAscii(
            String::from_utf8_lossy(&bytes).into_owned(),
        ));
    }
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.trim().to_string())
}

fn bcd_limit(digits: u8) -> Result<u16, MarshalError> {
    match digits {
        2 => Ok(99),
        4 => Ok(9999),
        _ => Err(MarshalError::BadWidth {
            data_type: "BCD",
            words: 1,
        }),
    }
}

fn encode_bcd(value: u16, digits: u8) -> Result<u16, MarshalError> {
    let limit = bcd_limit(digits)?;
    if value > limit {
        return Err(out_of_range(
            value,
            DataType::Bcd { digits },
            format!("{digits}-digit BCD holds 0-{limit}"),
        ));
    }

    let mut rest = value;
    let mut word = 0u16;
    for nibble in 0..digits {
        word |= (rest % 10) << (4 * u16::from(nibble));
        rest /= 10;
    }
    Ok(word)
}

fn decode_bcd(word: u16, digits: u8) -> Result<u16, MarshalError> {
    bcd_limit(digits)?;
    if digits == 2 && word > 0x00FF {
        return Err(MarshalError::InvalidBcd(word));
    }

    let mut value = 0u16;
    for nibble in (0..digits).rev() {
        let digit = (word >> (4 * u16::from(nibble))) & 0x0F;
        if digit > 9 {
            return Err(MarshalError::InvalidBcd(word));
        }
        value = value * 10 + digit;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEIGHT: DataType = DataType::Real { scale: 100.0 };

    fn real(v: f64) -> FieldValue {
        FieldValue::Real(v)
    }

    #[test]
    fn test_real_roundtrip_one_word() {
        for v in [0.0, 0.01, 1.5, -12.34, 327.67, -327.68, 123.45] {
            let words = encode(WEIGHT, 1, &real(v)).unwrap();
            assert_eq!(words.len(), 1);
            assert_eq!(decode(WEIGHT, &words).unwrap(), Reading::Value(real(v)), "value {v}");
        }
    }

    #[test]
    fn test_real_roundtrip_two_words() {
        for v in [0.0, 655.35, 655.36, 21474836.47, -21474836.48, 1234.56, 0.07] {
            let words = encode(WEIGHT, 2, &real(v)).unwrap();
            assert_eq!(words.len(), 2);
            assert_eq!(decode(WEIGHT, &words).unwrap(), Reading::Value(real(v)), "value {v}");
        }
    }

    #[test]
    fn test_real_two_words_high_word_first() {
        assert_eq!(encode(WEIGHT, 2, &real(655.36)).unwrap(), vec![0x0001, 0x0000]);
        assert_eq!(encode(WEIGHT, 2, &real(-1.0)).unwrap(), vec![0xFFFF, 0xFF9C]);
    }

    #[test]
    fn test_real_out_of_range_is_rejected() {
        assert!(matches!(
            encode(WEIGHT, 1, &real(327.68)),
            Err(MarshalError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(WEIGHT, 2, &real(21474836.48)),
            Err(MarshalError::OutOfRange { .. })
        ));
        assert!(encode(WEIGHT, 1, &real(f64::NAN)).is_err());
        assert!(encode(WEIGHT, 3, &real(1.0)).is_err());
    }

    #[test]
    fn test_all_ones_is_uninitialized_not_655_35() {
        let reading = decode(WEIGHT, &[65535]).unwrap();
        assert_eq!(reading, Reading::Uninitialized);
        assert_eq!(reading.as_real(), None);

        assert_eq!(decode(WEIGHT, &[0xFFFF, 0xFFFF]).unwrap(), Reading::Uninitialized);
        assert_eq!(decode(DataType::Boolean, &[0xFFFF]).unwrap(), Reading::Uninitialized);
        assert_eq!(
            decode(DataType::Ascii { chars: 4 }, &[0xFFFF, 0xFFFF]).unwrap(),
            Reading::Uninitialized
        );
    }

    #[test]
    fn test_sentinel_collision_is_refused() {
        assert!(encode(WEIGHT, 1, &real(-0.01)).is_err());
        assert!(encode(WEIGHT, 2, &real(-0.01)).is_err());
        // One half all-ones is a legitimate value.
        assert_eq!(
            decode(WEIGHT, &[0xFFFF, 0xFF9C]).unwrap(),
            Reading::Value(real(-1.0))
        );
    }

    #[test]
    fn test_ascii_roundtrip_and_padding() {
        let field = DataType::Ascii { chars: 10 };
        let words = encode(field, 5, &FieldValue::Text("WO-0042".into())).unwrap();
        assert_eq!(words, vec![0x574F, 0x2D30, 0x3034, 0x3200, 0x0000]);
        assert_eq!(
            decode(field, &words).unwrap(),
            Reading::Value(FieldValue::Text("WO-0042".into()))
        );
    }

    #[test]
    fn test_ascii_strips_whitespace() {
        let field = DataType::Ascii { chars: 8 };
        let words = encode(field, 4, &FieldValue::Text("  MIX1 ".into())).unwrap();
        assert_eq!(decode(field, &words).unwrap().as_text(), Some("MIX1"));
    }

    #[test]
    fn test_ascii_truncates_deterministically() {
        let field = DataType::Ascii { chars: 5 };
        let words = encode(field, 3, &FieldValue::Text("ABCDEFGH".into())).unwrap();
        assert_eq!(words, vec![0x4142, 0x4344, 0x4500]);
        assert_eq!(decode(field, &words).unwrap().as_text(), Some("ABCDE"));
    }

    #[test]
    fn test_ascii_rejects_non_ascii() {
        let field = DataType::Ascii { chars: 4 };
        assert!(matches!(
            encode(field, 2, &FieldValue::Text("Ölé".into())),
            Err(MarshalError::NotAscii(_))
        ));
        assert!(encode(field, 3, &FieldValue::Text("OK".into())).is_err());
    }

    #[test]
    fn test_boolean() {
        assert_eq!(encode(DataType::Boolean, 1, &FieldValue::Bool(true)).unwrap(), vec![1]);
        assert_eq!(decode(DataType::Boolean, &[0x0002]).unwrap().as_bool(), Some(true));
        assert_eq!(decode(DataType::Boolean, &[0]).unwrap().as_bool(), Some(false));
    }

    #[test]
    fn test_bcd_four_digits() {
        let field = DataType::Bcd { digits: 4 };
        assert_eq!(encode(field, 1, &FieldValue::Bcd(1234)).unwrap(), vec![0x1234]);
        assert_eq!(encode(field, 1, &FieldValue::Bcd(9999)).unwrap(), vec![0x9999]);
        assert_eq!(decode(field, &[0x0507]).unwrap().as_bcd(), Some(507));
        assert!(encode(field, 1, &FieldValue::Bcd(10000)).is_err());
    }

    #[test]
    fn test_bcd_two_digits() {
        let field = DataType::Bcd { digits: 2 };
        assert_eq!(encode(field, 1, &FieldValue::Bcd(42)).unwrap(), vec![0x0042]);
        assert_eq!(decode(field, &[0x0099]).unwrap().as_bcd(), Some(99));
        assert!(encode(field, 1, &FieldValue::Bcd(100)).is_err());
        assert!(matches!(decode(field, &[0x0142]), Err(MarshalError::InvalidBcd(0x0142))));
    }

    #[test]
    fn test_bcd_rejects_hex_nibbles() {
        assert!(matches!(
            decode(DataType::Bcd { digits: 4 }, &[0x12A4]),
            Err(MarshalError::InvalidBcd(_))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        assert!(matches!(
            encode(DataType::Boolean, 1, &FieldValue::Real(1.0)),
            Err(MarshalError::TypeMismatch { .. })
        ));
    }
}

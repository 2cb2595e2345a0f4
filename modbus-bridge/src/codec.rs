//! Conversion between raw Modbus registers and typed values.
//!
//! Multi-register values are assembled according to the catalog's
//! [`WordOrder`]; the same functions serve the read path (decode) and the
//! write path (encode), so a value written and read back is unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::{DataType, RegisterDescriptor, WordOrder};
use crate::error::CodecError;

/// Decoded register value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Bool(v) => write!(f, "{}", v),
            RegisterValue::Unsigned(v) => write!(f, "{}", v),
            RegisterValue::Signed(v) => write!(f, "{}", v),
            RegisterValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for RegisterValue {
    fn from(v: bool) -> Self {
        RegisterValue::Bool(v)
    }
}

impl From<u16> for RegisterValue {
    fn from(v: u16) -> Self {
        RegisterValue::Unsigned(v.into())
    }
}

impl From<u32> for RegisterValue {
    fn from(v: u32) -> Self {
        RegisterValue::Unsigned(v.into())
    }
}

impl From<u64> for RegisterValue {
    fn from(v: u64) -> Self {
        RegisterValue::Unsigned(v)
    }
}

impl From<i16> for RegisterValue {
    fn from(v: i16) -> Self {
        RegisterValue::Signed(v.into())
    }
}

impl From<i32> for RegisterValue {
    fn from(v: i32) -> Self {
        RegisterValue::Signed(v.into())
    }
}

impl From<i64> for RegisterValue {
    fn from(v: i64) -> Self {
        RegisterValue::Signed(v)
    }
}

impl From<f32> for RegisterValue {
    fn from(v: f32) -> Self {
        RegisterValue::Float(v.into())
    }
}

impl From<f64> for RegisterValue {
    fn from(v: f64) -> Self {
        RegisterValue::Float(v)
    }
}

/// Raw register content as exchanged with a transport or the host table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// Convert raw registers into a typed value.
pub fn decode(
    descriptor: &RegisterDescriptor,
    raw: &RawValue,
    order: WordOrder,
) -> Result<RegisterValue, CodecError> {
    match raw {
        RawValue::Bits(bits) if descriptor.kind.is_bit() => decode_bits(descriptor, bits),
        RawValue::Words(words) if !descriptor.kind.is_bit() => {
            decode_words(descriptor, words, order)
        }
        _ => Err(CodecError::KindMismatch),
    }
}

/// Convert a typed value into raw registers.
pub fn encode(
    descriptor: &RegisterDescriptor,
    value: &RegisterValue,
    order: WordOrder,
) -> Result<RawValue, CodecError> {
    if descriptor.kind.is_bit() {
        encode_bit(descriptor, value).map(|bit| RawValue::Bits(vec![bit]))
    } else {
        encode_words(descriptor, value, order).map(RawValue::Words)
    }
}

/// Decode a single-bit descriptor.
pub fn decode_bits(
    descriptor: &RegisterDescriptor,
    bits: &[bool],
) -> Result<RegisterValue, CodecError> {
    match bits {
        [bit] => Ok(RegisterValue::Bool(*bit)),
        _ => Err(CodecError::WrongLength {
            expected: descriptor.length as usize,
            actual: bits.len(),
        }),
    }
}

/// Encode a value for a single-bit descriptor. Integers 0 and 1 are accepted.
pub fn encode_bit(descriptor: &RegisterDescriptor, value: &RegisterValue) -> Result<bool, CodecError> {
    match value {
        RegisterValue::Bool(bit) => Ok(*bit),
        RegisterValue::Unsigned(0) | RegisterValue::Signed(0) => Ok(false),
        RegisterValue::Unsigned(1) | RegisterValue::Signed(1) => Ok(true),
        _ => Err(CodecError::TypeMismatch {
            data_type: descriptor.data_type,
            value: *value,
        }),
    }
}

/// Decode a word descriptor.
pub fn decode_words(
    descriptor: &RegisterDescriptor,
    words: &[u16],
    order: WordOrder,
) -> Result<RegisterValue, CodecError> {
    if words.len() != descriptor.length as usize {
        return Err(CodecError::WrongLength {
            expected: descriptor.length as usize,
            actual: words.len(),
        });
    }

    let raw = combine(words, order);
    let value = match (descriptor.data_type, descriptor.length) {
        (DataType::Unsigned, _) => RegisterValue::Unsigned(raw),
        (DataType::Signed, 1) => RegisterValue::Signed((raw as u16 as i16).into()),
        (DataType::Signed, 2) => RegisterValue::Signed((raw as u32 as i32).into()),
        (DataType::Signed, _) => RegisterValue::Signed(raw as i64),
        (DataType::Float, 2) => RegisterValue::Float(f32::from_bits(raw as u32).into()),
        (DataType::Float, _) => RegisterValue::Float(f64::from_bits(raw)),
        (DataType::Bit, _) => return Err(CodecError::KindMismatch),
    };

    Ok(value)
}

/// Encode a value for a word descriptor.
pub fn encode_words(
    descriptor: &RegisterDescriptor,
    value: &RegisterValue,
    order: WordOrder,
) -> Result<Vec<u16>, CodecError> {
    let length = descriptor.length;
    let bits = 16 * u32::from(length);
    let mismatch = || CodecError::TypeMismatch {
        data_type: descriptor.data_type,
        value: *value,
    };
    let out_of_range = || CodecError::OutOfRange {
        data_type: descriptor.data_type,
        length,
        value: *value,
    };

    let raw: u64 = match descriptor.data_type {
        DataType::Unsigned => {
            let v = match *value {
                RegisterValue::Unsigned(v) => v,
                RegisterValue::Signed(v) => u64::try_from(v).map_err(|_| out_of_range())?,
                _ => return Err(mismatch()),
            };
            if bits < 64 && v >> bits != 0 {
                return Err(out_of_range());
            }
            v
        }
        DataType::Signed => {
            let v = match *value {
                RegisterValue::Signed(v) => v,
                RegisterValue::Unsigned(v) => i64::try_from(v).map_err(|_| out_of_range())?,
                _ => return Err(mismatch()),
            };
            if bits < 64 {
                let min = -(1i64 << (bits - 1));
                let max = (1i64 << (bits - 1)) - 1;
                if v < min || v > max {
                    return Err(out_of_range());
                }
                (v as u64) & ((1u64 << bits) - 1)
            } else {
                v as u64
            }
        }
        DataType::Float => {
            let v = match *value {
                RegisterValue::Float(v) => v,
                RegisterValue::Unsigned(v) => v as f64,
                RegisterValue::Signed(v) => v as f64,
                RegisterValue::Bool(_) => return Err(mismatch()),
            };
            if length == 2 {
                if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                    return Err(out_of_range());
                }
                u64::from((v as f32).to_bits())
            } else {
                v.to_bits()
            }
        }
        DataType::Bit => return Err(mismatch()),
    };

    Ok(split(raw, length, order))
}

fn combine(words: &[u16], order: WordOrder) -> u64 {
    let fold = |acc: u64, word: &u16| (acc << 16) | u64::from(*word);
    match order {
        WordOrder::Big => words.iter().fold(0, fold),
        WordOrder::Little => words.iter().rev().fold(0, fold),
    }
}

fn split(raw: u64, length: u16, order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = (0..length)
        .map(|i| (raw >> (16 * u32::from(length - 1 - i))) as u16)
        .collect();
    if order == WordOrder::Little {
        words.reverse();
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RegisterKind;

    fn descriptor(data_type: DataType, length: u16) -> RegisterDescriptor {
        RegisterDescriptor {
            kind: RegisterKind::Holding,
            address: 0,
            length,
            data_type,
            name: None,
        }
    }

    #[test]
    fn test_decode_f32_big_endian() {
        // Value: 123.456 in IEEE 754 = 0x42F6E979
        let value = decode_words(
            &descriptor(DataType::Float, 2),
            &[0x42F6, 0xE979],
            WordOrder::Big,
        )
        .unwrap();

        match value {
            RegisterValue::Float(v) => assert!((v - 123.456).abs() < 0.001),
            other => panic!("Expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_f32_little_word_order() {
        let value = decode_words(
            &descriptor(DataType::Float, 2),
            &[0xE979, 0x42F6],
            WordOrder::Little,
        )
        .unwrap();

        match value {
            RegisterValue::Float(v) => assert!((v - 123.456).abs() < 0.001),
            other => panic!("Expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_word_order_applies_on_write_path() {
        let d = descriptor(DataType::Unsigned, 2);
        let value = RegisterValue::Unsigned(0x0001_0002);

        assert_eq!(
            encode_words(&d, &value, WordOrder::Big).unwrap(),
            vec![0x0001, 0x0002]
        );
        assert_eq!(
            encode_words(&d, &value, WordOrder::Little).unwrap(),
            vec![0x0002, 0x0001]
        );
    }

    #[test]
    fn test_decode_signed_widths() {
        assert_eq!(
            decode_words(&descriptor(DataType::Signed, 1), &[0xFFFF], WordOrder::Big).unwrap(),
            RegisterValue::Signed(-1)
        );
        assert_eq!(
            decode_words(
                &descriptor(DataType::Signed, 2),
                &[0xFFFF, 0xFFFE],
                WordOrder::Big
            )
            .unwrap(),
            RegisterValue::Signed(-2)
        );
        assert_eq!(
            decode_words(
                &descriptor(DataType::Signed, 4),
                &[0xFFFF, 0xFFFF, 0xFFFF, 0xFFFD],
                WordOrder::Big
            )
            .unwrap(),
            RegisterValue::Signed(-3)
        );
    }

    #[test]
    fn test_encode_signed_negative() {
        assert_eq!(
            encode_words(
                &descriptor(DataType::Signed, 1),
                &RegisterValue::Signed(-1),
                WordOrder::Big
            )
            .unwrap(),
            vec![0xFFFF]
        );
        assert_eq!(
            encode_words(
                &descriptor(DataType::Signed, 2),
                &RegisterValue::Signed(-2),
                WordOrder::Little
            )
            .unwrap(),
            vec![0xFFFE, 0xFFFF]
        );
    }

    #[test]
    fn test_encode_f64() {
        let d = descriptor(DataType::Float, 4);
        let words = encode_words(&d, &RegisterValue::Float(-2.5), WordOrder::Big).unwrap();
        assert_eq!(words, vec![0xC004, 0x0000, 0x0000, 0x0000]);
        assert_eq!(
            decode_words(&d, &words, WordOrder::Big).unwrap(),
            RegisterValue::Float(-2.5)
        );
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let result = encode_words(
            &descriptor(DataType::Unsigned, 1),
            &RegisterValue::Unsigned(70_000),
            WordOrder::Big,
        );
        assert!(matches!(result, Err(CodecError::OutOfRange { .. })));

        let result = encode_words(
            &descriptor(DataType::Signed, 1),
            &RegisterValue::Signed(40_000),
            WordOrder::Big,
        );
        assert!(matches!(result, Err(CodecError::OutOfRange { .. })));

        let result = encode_words(
            &descriptor(DataType::Unsigned, 2),
            &RegisterValue::Signed(-5),
            WordOrder::Big,
        );
        assert!(matches!(result, Err(CodecError::OutOfRange { .. })));

        let result = encode_words(
            &descriptor(DataType::Float, 2),
            &RegisterValue::Float(1e300),
            WordOrder::Big,
        );
        assert!(matches!(result, Err(CodecError::OutOfRange { .. })));
    }

    #[test]
    fn test_encode_rejects_type_mismatch() {
        let result = encode_words(
            &descriptor(DataType::Unsigned, 1),
            &RegisterValue::Bool(true),
            WordOrder::Big,
        );
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));

        let result = encode_words(
            &descriptor(DataType::Signed, 1),
            &RegisterValue::Float(1.5),
            WordOrder::Big,
        );
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));
    }

    #[test]
    fn test_integers_accepted_for_float() {
        let d = descriptor(DataType::Float, 2);
        let words = encode_words(&d, &RegisterValue::Unsigned(3), WordOrder::Big).unwrap();
        assert_eq!(
            decode_words(&d, &words, WordOrder::Big).unwrap(),
            RegisterValue::Float(3.0)
        );
    }

    #[test]
    fn test_bit_values() {
        let coil = RegisterDescriptor {
            kind: RegisterKind::Coil,
            address: 3,
            length: 1,
            data_type: DataType::Bit,
            name: None,
        };

        assert_eq!(
            encode(&coil, &RegisterValue::Bool(true), WordOrder::Big).unwrap(),
            RawValue::Bits(vec![true])
        );
        assert_eq!(encode_bit(&coil, &RegisterValue::Unsigned(0)), Ok(false));
        assert!(encode_bit(&coil, &RegisterValue::Unsigned(2)).is_err());
        assert_eq!(
            decode(&coil, &RawValue::Bits(vec![true]), WordOrder::Big).unwrap(),
            RegisterValue::Bool(true)
        );
        assert_eq!(
            decode(&coil, &RawValue::Words(vec![1]), WordOrder::Big),
            Err(CodecError::KindMismatch)
        );
    }

    #[test]
    fn test_decode_wrong_length() {
        let result = decode_words(&descriptor(DataType::Unsigned, 2), &[1], WordOrder::Big);
        assert_eq!(
            result,
            Err(CodecError::WrongLength {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_value_serialization_is_untagged() {
        assert_eq!(
            serde_json::to_string(&RegisterValue::Unsigned(42)).unwrap(),
            "42"
        );
        assert_eq!(
            serde_json::from_str::<RegisterValue>("-7").unwrap(),
            RegisterValue::Signed(-7)
        );
        assert_eq!(
            serde_json::from_str::<RegisterValue>("true").unwrap(),
            RegisterValue::Bool(true)
        );
    }
}

//! Register codec: turns raw 16-bit register words into typed engineering
//! values and back. Words arrive big-endian from the wire; the byte-order
//! tag describes how a device spreads a value's bytes across its registers.
//!
//! All functions are pure and synchronous. Whether a byte order fits a data
//! type is checked when the schema is loaded ([`check_width`]); a live
//! decode can only fail on a short word slice.

use byteorder::{BigEndian, ByteOrder as _};

use daqsrv_protocol::{ByteOrder, DataType, DecodeError, Value};

/// Schema-load gate: reject byte orders whose width does not match the data
/// type, so decode never sees an ill-formed combination.
pub fn check_width(data_type: DataType, order: ByteOrder) -> Result<(), DecodeError> {
    if order.word_count() != data_type.word_count() {
        return Err(DecodeError::WidthMismatch {
            data_type,
            order: order.to_string(),
        });
    }
    Ok(())
}

/// Decode one value of `data_type` from the start of `words`.
///
/// FLOAT32 values that come out non-finite (NaN, ±∞) surface as
/// [`Value::Null`]; they are unreadable, not errors.
pub fn decode(data_type: DataType, order: ByteOrder, words: &[u16]) -> Result<Value, DecodeError> {
    let needed = data_type.word_count();
    if words.len() < needed {
        return Err(DecodeError::InsufficientWords {
            needed,
            got: words.len(),
        });
    }
    check_width(data_type, order)?;
    let value = match data_type {
        DataType::Uint16 => Value::Number(single_word(order, words[0]) as f64),
        DataType::Int16 => Value::Number(single_word(order, words[0]) as i16 as f64),
        DataType::Uint32 => Value::Number(double_word(order, words[0], words[1]) as f64),
        DataType::Int32 => Value::Number(double_word(order, words[0], words[1]) as i32 as f64),
        DataType::Float32 => {
            let x = f32::from_bits(double_word(order, words[0], words[1]));
            if x.is_finite() {
                Value::Number(x as f64)
            } else {
                Value::Null
            }
        }
        DataType::Bool => Value::Bool(words[0] != 0),
    };
    Ok(value)
}

/// Encode a value back into register words; the inverse of [`decode`] for
/// all well-formed inputs. Used by the write paths.
pub fn encode(data_type: DataType, order: ByteOrder, value: &Value) -> Result<Vec<u16>, DecodeError> {
    check_width(data_type, order)?;
    match data_type {
        DataType::Bool => match value {
            Value::Bool(x) => Ok(vec![if *x { 1 } else { 0 }]),
            _ => Err(DecodeError::NotNumeric),
        },
        DataType::Uint16 => {
            let x = integral(data_type, value, 0.0, u16::MAX as f64)?;
            Ok(vec![restore_single_word(order, x as u16)])
        }
        DataType::Int16 => {
            let x = integral(data_type, value, i16::MIN as f64, i16::MAX as f64)?;
            Ok(vec![restore_single_word(order, x as i16 as u16)])
        }
        DataType::Uint32 => {
            let x = integral(data_type, value, 0.0, u32::MAX as f64)?;
            Ok(restore_double_word(order, x as u32).to_vec())
        }
        DataType::Int32 => {
            let x = integral(data_type, value, i32::MIN as f64, i32::MAX as f64)?;
            Ok(restore_double_word(order, x as i32 as u32).to_vec())
        }
        DataType::Float32 => {
            let x = value.as_f64().ok_or(DecodeError::NotNumeric)?;
            Ok(restore_double_word(order, (x as f32).to_bits()).to_vec())
        }
    }
}

fn integral(data_type: DataType, value: &Value, min: f64, max: f64) -> Result<f64, DecodeError> {
    let x = value.as_f64().ok_or(DecodeError::NotNumeric)?;
    if x.fract() != 0.0 || x < min || x > max {
        return Err(DecodeError::OutOfRange { data_type, value: x });
    }
    Ok(x)
}

fn single_word(order: ByteOrder, word: u16) -> u16 {
    match order {
        ByteOrder::Ba => word.swap_bytes(),
        _ => word,
    }
}

fn restore_single_word(order: ByteOrder, word: u16) -> u16 {
    // byte swapping is its own inverse
    single_word(order, word)
}

fn double_word(order: ByteOrder, w0: u16, w1: u16) -> u32 {
    let [a, b] = w0.to_be_bytes();
    let [c, d] = w1.to_be_bytes();
    let bytes = match order {
        ByteOrder::Abcd => [a, b, c, d],
        ByteOrder::Cdab => [c, d, a, b],
        ByteOrder::Badc => [b, a, d, c],
        ByteOrder::Dcba => [d, c, b, a],
        // single-word orders are rejected by check_width
        ByteOrder::Ab | ByteOrder::Ba => unreachable!(),
    };
    BigEndian::read_u32(&bytes)
}

fn restore_double_word(order: ByteOrder, value: u32) -> [u16; 2] {
    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, value);
    let [a, b, c, d] = bytes;
    let (hi, lo) = match order {
        ByteOrder::Abcd => ([a, b], [c, d]),
        ByteOrder::Cdab => ([c, d], [a, b]),
        ByteOrder::Badc => ([b, a], [d, c]),
        ByteOrder::Dcba => ([d, c], [b, a]),
        ByteOrder::Ab | ByteOrder::Ba => unreachable!(),
    };
    [u16::from_be_bytes(hi), u16::from_be_bytes(lo)]
}

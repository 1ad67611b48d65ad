//! Value codec: typed host values to and from the big-endian wire layout.
//!
//! A parameter of type `T` and array length `N` occupies `N * T::element_size()`
//! bytes. String and data parameters treat `N` as a byte length. All offsets
//! reaching this module are already resolved (see [`resolve_offset`]).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::types::ParamType;
use crate::value::Value;

/// Resolve a list-style offset, where negative values count from the end.
pub fn resolve_offset(offset: i32, len: u16) -> Result<u16> {
    let resolved = if offset < 0 {
        offset + len as i32
    } else {
        offset
    };
    if resolved < 0 || resolved >= len as i32 {
        return Err(Error::IndexOutOfRange { offset, len });
    }
    Ok(resolved as u16)
}

/// Byte length of the region addressed by `offset` (`None` = whole parameter).
pub fn region_len(ty: ParamType, len: u16, offset: Option<u16>) -> usize {
    match offset {
        Some(_) => ty.element_size(),
        None => ty.element_size() * len.max(1) as usize,
    }
}

/// Encode `value` into the raw bytes of the addressed region.
pub fn encode(ty: ParamType, len: u16, value: &Value, offset: Option<u16>) -> Result<Vec<u8>> {
    let len = len.max(1);
    if let Some(index) = offset.filter(|i| *i >= len) {
        return Err(Error::IndexOutOfRange {
            offset: index as i32,
            len,
        });
    }

    match (ty, offset) {
        (ParamType::String, None) => encode_string(len, value),
        (ParamType::Data, None) => encode_data(len, value),
        (_, Some(_)) => encode_element(ty, value),
        (_, None) if len == 1 => encode_element(ty, value),
        (_, None) => {
            let items = match value {
                Value::Array(items) => items,
                other => return Err(mismatch(ty, other)),
            };
            if items.len() != len as usize {
                return Err(Error::LengthMismatch {
                    expected: len as usize,
                    actual: items.len(),
                });
            }
            let mut out = Vec::with_capacity(ty.element_size() * items.len());
            for item in items {
                out.extend_from_slice(&encode_element(ty, item)?);
            }
            Ok(out)
        }
    }
}

/// Decode the raw bytes of the addressed region into a host value.
pub fn decode(ty: ParamType, len: u16, raw: &[u8], offset: Option<u16>) -> Result<Value> {
    let len = len.max(1);
    let expected = region_len(ty, len, offset);
    if raw.len() != expected {
        return Err(Error::malformed(format!(
            "{ty} value needs {expected} bytes, got {}",
            raw.len()
        )));
    }

    Ok(match (ty, offset) {
        (ParamType::String, None) => {
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            Value::Str(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
        (ParamType::Data, None) => Value::Bytes(raw.to_vec()),
        (_, Some(_)) => decode_element(ty, raw),
        (_, None) if len == 1 => decode_element(ty, raw),
        (_, None) => Value::Array(
            raw.chunks_exact(ty.element_size())
                .map(|chunk| decode_element(ty, chunk))
                .collect(),
        ),
    })
}

fn mismatch(ty: ParamType, value: &Value) -> Error {
    Error::TypeMismatch {
        expected: ty,
        value: value.to_string(),
    }
}

fn encode_string(len: u16, value: &Value) -> Result<Vec<u8>> {
    let text = match value {
        Value::Str(s) => s.clone(),
        Value::Int(_) | Value::Uint(_) | Value::Float(_) => value.to_string(),
        other => return Err(mismatch(ParamType::String, other)),
    };
    let mut cut = text.len().min(len as usize);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = vec![0u8; len as usize];
    out[..cut].copy_from_slice(&text.as_bytes()[..cut]);
    Ok(out)
}

fn encode_data(len: u16, value: &Value) -> Result<Vec<u8>> {
    let bytes = match value {
        Value::Bytes(b) => b.clone(),
        Value::Str(s) => parse_hex(s).ok_or_else(|| mismatch(ParamType::Data, value))?,
        other => return Err(mismatch(ParamType::Data, other)),
    };
    if bytes.len() > len as usize {
        return Err(Error::LengthMismatch {
            expected: len as usize,
            actual: bytes.len(),
        });
    }
    let mut out = vec![0u8; len as usize];
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(out)
}

/// Encode a single array slot.
pub fn encode_element(ty: ParamType, value: &Value) -> Result<Vec<u8>> {
    if !ty.is_bytes() {
        if let Value::Str(text) = value {
            let parsed = parse_text(ty, text)?;
            return encode_element(ty, &parsed);
        }
    }

    let mut buf = vec![0u8; ty.element_size()];
    match ty {
        ParamType::Uint8 | ParamType::Xint8 => buf[0] = unsigned(ty, value, u8::MAX as u64)? as u8,
        ParamType::Uint16 | ParamType::Xint16 => {
            BigEndian::write_u16(&mut buf, unsigned(ty, value, u16::MAX as u64)? as u16)
        }
        ParamType::Uint32 | ParamType::Xint32 => {
            BigEndian::write_u32(&mut buf, unsigned(ty, value, u32::MAX as u64)? as u32)
        }
        ParamType::Uint64 | ParamType::Xint64 => {
            BigEndian::write_u64(&mut buf, unsigned(ty, value, u64::MAX)?)
        }
        ParamType::Int8 => buf[0] = signed(ty, value, i8::MIN as i64, i8::MAX as i64)? as i8 as u8,
        ParamType::Int16 => BigEndian::write_i16(
            &mut buf,
            signed(ty, value, i16::MIN as i64, i16::MAX as i64)? as i16,
        ),
        ParamType::Int32 => BigEndian::write_i32(
            &mut buf,
            signed(ty, value, i32::MIN as i64, i32::MAX as i64)? as i32,
        ),
        ParamType::Int64 => BigEndian::write_i64(&mut buf, signed(ty, value, i64::MIN, i64::MAX)?),
        ParamType::Float => {
            let v = value.as_f64().ok_or_else(|| mismatch(ty, value))?;
            BigEndian::write_f32(&mut buf, v as f32)
        }
        ParamType::Double => {
            let v = value.as_f64().ok_or_else(|| mismatch(ty, value))?;
            BigEndian::write_f64(&mut buf, v)
        }
        ParamType::String => match value {
            Value::Str(s) if s.len() <= 1 => buf[0] = s.bytes().next().unwrap_or(0),
            other => buf[0] = unsigned(ty, other, u8::MAX as u64)? as u8,
        },
        ParamType::Data => match value {
            Value::Bytes(b) if b.len() == 1 => buf[0] = b[0],
            other => buf[0] = unsigned(ty, other, u8::MAX as u64)? as u8,
        },
    }
    Ok(buf)
}

/// Decode a single array slot. `raw` must hold exactly one element.
pub fn decode_element(ty: ParamType, raw: &[u8]) -> Value {
    match ty {
        ParamType::Uint8 | ParamType::Xint8 => Value::Uint(raw[0] as u64),
        ParamType::Uint16 | ParamType::Xint16 => Value::Uint(BigEndian::read_u16(raw) as u64),
        ParamType::Uint32 | ParamType::Xint32 => Value::Uint(BigEndian::read_u32(raw) as u64),
        ParamType::Uint64 | ParamType::Xint64 => Value::Uint(BigEndian::read_u64(raw)),
        ParamType::Int8 => Value::Int(raw[0] as i8 as i64),
        ParamType::Int16 => Value::Int(BigEndian::read_i16(raw) as i64),
        ParamType::Int32 => Value::Int(BigEndian::read_i32(raw) as i64),
        ParamType::Int64 => Value::Int(BigEndian::read_i64(raw)),
        ParamType::Float => Value::Float(BigEndian::read_f32(raw) as f64),
        ParamType::Double => Value::Float(BigEndian::read_f64(raw)),
        ParamType::String => Value::Str(String::from_utf8_lossy(&raw[..1]).into_owned()),
        ParamType::Data => Value::Bytes(raw.to_vec()),
    }
}

fn unsigned(ty: ParamType, value: &Value, max: u64) -> Result<u64> {
    let v = match *value {
        Value::Float(f) if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 => f as u64,
        _ => value.as_u64().ok_or_else(|| mismatch(ty, value))?,
    };
    if v > max {
        return Err(mismatch(ty, value));
    }
    Ok(v)
}

fn signed(ty: ParamType, value: &Value, min: i64, max: i64) -> Result<i64> {
    let v = match *value {
        Value::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            f as i64
        }
        _ => value.as_i64().ok_or_else(|| mismatch(ty, value))?,
    };
    if v < min || v > max {
        return Err(mismatch(ty, value));
    }
    Ok(v)
}

/// Parse text into a value of the given type.
///
/// Integers accept decimal or `0x`-prefixed hexadecimal. This is the single
/// textual path used by local and remote writes alike.
pub fn parse_text(ty: ParamType, text: &str) -> Result<Value> {
    let trimmed = text.trim();
    let err = || Error::TypeMismatch {
        expected: ty,
        value: format!("\"{text}\""),
    };

    if ty.is_unsigned() {
        let v = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        return v.map(Value::Uint).map_err(|_| err());
    }
    if ty.is_signed() {
        let (neg, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let magnitude = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
            Some(hex) => i128::from_str_radix(hex, 16),
            None => body.parse::<i128>(),
        }
        .map_err(|_| err())?;
        let v = if neg { -magnitude } else { magnitude };
        return i64::try_from(v).map(Value::Int).map_err(|_| err());
    }
    if ty.is_float() {
        return trimmed.parse::<f64>().map(Value::Float).map_err(|_| err());
    }
    match ty {
        ParamType::String => Ok(Value::Str(text.to_owned())),
        _ => parse_hex(trimmed).map(Value::Bytes).ok_or_else(err),
    }
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Render a decoded value the way the parameter type prefers to be shown.
pub fn format_value(ty: ParamType, value: &Value) -> String {
    match (ty.is_hex(), value) {
        (true, Value::Uint(v)) => format!("{v:#x}"),
        (true, Value::Array(items)) => {
            let parts: Vec<String> = items.iter().map(|v| format_value(ty, v)).collect();
            format!("[{}]", parts.join(" "))
        }
        _ => value.to_string(),
    }
}

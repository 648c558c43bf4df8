//! Typed PLC values and the recursive codec that maps them to wire bytes.
//!
//! Dispatch is on the numeric type tag the runtime stores in its tables
//! (`ADST_*`); `BIGTYPE` values are further dispatched by type name against
//! the uploaded data-type dictionary.

use byteorder::{ByteOrder, LE};
use chrono::{DateTime, Local, TimeZone, Utc};

use crate::symbol::TypeMap;
use crate::tag::FindTag;
use crate::{Error, Result};

/// Primitive type tags used in symbol and data-type tables (AdsDef.h).
#[allow(missing_docs)]
pub mod adst {
    /// Pointer-like value; readable, never writable.
    pub const VOID: u32 = 0;
    pub const INT16: u32 = 2;
    pub const INT32: u32 = 3;
    pub const REAL32: u32 = 4;
    pub const REAL64: u32 = 5;
    pub const INT8: u32 = 16;
    pub const UINT8: u32 = 17;
    pub const UINT16: u32 = 18;
    pub const UINT32: u32 = 19;
    pub const INT64: u32 = 20;
    pub const UINT64: u32 = 21;
    pub const STRING: u32 = 30;
    pub const WSTRING: u32 = 31;
    /// 80-bit extended float; not supported by this client.
    pub const REAL80: u32 = 32;
    pub const BIT: u32 = 33;
    /// Composite; the type name decides the real shape.
    pub const BIGTYPE: u32 = 65;
}

/// Type names the runtime uses for second-resolution timestamps.
const DATE_NAMES: &[&str] = &["DATE", "DT", "DATE_AND_TIME"];
/// Type names the runtime uses for milliseconds-since-midnight values.
const TOD_NAMES: &[&str] = &["TIME", "TOD", "TIME_OF_DAY"];

/// A decoded PLC value.
///
/// Composites nest: a structure decodes to `Struct` with one entry per
/// sub-item in declaration order, an array to `Array` with one element per
/// slot (outermost dimension first).  `Blob` is the fallback for types the
/// tables do not describe.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Real32(f32),
    Real64(f64),
    /// STRING/WSTRING payloads, and the `HH:MM` rendering of TIME/TOD.
    String(String),
    /// DATE / DT / DATE_AND_TIME.
    Timestamp(DateTime<Utc>),
    /// The numeric value of a VOID (pointer) read.
    Pointer(u32),
    Struct(Vec<(String, Value)>),
    Array(Vec<Value>),
    /// Raw bytes of a type the codec cannot interpret.
    Blob(Vec<u8>),
}

impl Value {
    /// Find a field of a `Struct` value by case-insensitive name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(items) => items
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

// The element shape the recursive codec works on: a resolved tag, a
// sub-item, or one array level below either.
#[derive(Clone, Copy)]
struct Shape<'a> {
    kind: u32,
    type_name: &'a str,
    size: u32,
    dims: &'a [(i32, u32)],
}

/// Decode `data` according to the resolved tag.
pub fn decode(tag: &FindTag, types: &TypeMap, data: &[u8]) -> Result<Value> {
    let shape = Shape { kind: tag.kind, type_name: &tag.type_name, size: tag.size, dims: &[] };
    decode_shape(&shape, types, data)
}

/// Encode `value` according to the resolved tag, producing exactly the
/// number of bytes the tag's type occupies.
pub fn encode(tag: &FindTag, types: &TypeMap, value: &Value) -> Result<Vec<u8>> {
    let shape = Shape { kind: tag.kind, type_name: &tag.type_name, size: tag.size, dims: &[] };
    encode_shape(&shape, types, value)
}

fn need(data: &[u8], n: usize) -> Result<&[u8]> {
    if data.len() < n {
        return Err(Error::DecodeInvalid("value data shorter than its type"));
    }
    Ok(&data[..n])
}

fn decode_shape(shape: &Shape, types: &TypeMap, data: &[u8]) -> Result<Value> {
    if let Some((&(_, length), rest)) = shape.dims.split_first() {
        if length == 0 {
            return Err(Error::DecodeInvalid("array dimension of length zero"));
        }
        let chunk = shape.size / length;
        let data = need(data, shape.size as usize)?;
        let mut elems = Vec::with_capacity(length as usize);
        for i in 0..length {
            let at = (i * chunk) as usize;
            let elem = Shape { size: chunk, dims: rest, ..*shape };
            elems.push(decode_shape(&elem, types, &data[at..at + chunk as usize])?);
        }
        return Ok(Value::Array(elems));
    }

    match shape.kind {
        adst::BIT => Ok(Value::Bool(need(data, 1)?[0] != 0)),
        adst::INT8 => Ok(Value::Int8(need(data, 1)?[0] as i8)),
        adst::UINT8 => Ok(Value::UInt8(need(data, 1)?[0])),
        adst::INT16 => Ok(Value::Int16(LE::read_i16(need(data, 2)?))),
        adst::UINT16 => Ok(Value::UInt16(LE::read_u16(need(data, 2)?))),
        adst::INT32 => Ok(Value::Int32(LE::read_i32(need(data, 4)?))),
        adst::UINT32 => Ok(Value::UInt32(LE::read_u32(need(data, 4)?))),
        adst::INT64 => Ok(Value::Int64(LE::read_i64(need(data, 8)?))),
        adst::UINT64 => Ok(Value::UInt64(LE::read_u64(need(data, 8)?))),
        adst::REAL32 => Ok(Value::Real32(LE::read_f32(need(data, 4)?))),
        adst::REAL64 => Ok(Value::Real64(LE::read_f64(need(data, 8)?))),
        adst::REAL80 => Err(Error::UnsupportedType("REAL80".into())),
        adst::VOID => Ok(Value::Pointer(LE::read_u32(need(data, 4)?))),
        adst::STRING | adst::WSTRING => {
            let raw = need(data, shape.size as usize)?;
            Ok(Value::String(latin1_until_nul(raw)))
        }
        adst::BIGTYPE => decode_bigtype(shape, types, data),
        // Tags we do not know decode to their raw bytes.
        _ => Ok(Value::Blob(need(data, shape.size as usize)?.to_vec())),
    }
}

fn decode_bigtype(shape: &Shape, types: &TypeMap, data: &[u8]) -> Result<Value> {
    if DATE_NAMES.contains(&shape.type_name) {
        let secs = LE::read_u32(need(data, 4)?);
        return Ok(Value::Timestamp(unix_secs_to_utc(secs)));
    }
    if TOD_NAMES.contains(&shape.type_name) {
        let millis = LE::read_u32(need(data, 4)?);
        return Ok(Value::String(time_of_day_string(millis)?));
    }

    match types.get(shape.type_name) {
        Some(dt) if !dt.array_dims.is_empty() => {
            let inner = Shape {
                kind: dt.data_type_id,
                type_name: &dt.type_name,
                size: dt.size,
                dims: &dt.array_dims,
            };
            decode_shape(&inner, types, data)
        }
        Some(dt) if !dt.sub_items.is_empty() => {
            let data = need(data, dt.size as usize)?;
            let mut items = Vec::with_capacity(dt.sub_items.len());
            for sub in &dt.sub_items {
                let end = sub
                    .offset
                    .checked_add(sub.size)
                    .filter(|&end| end <= dt.size)
                    .ok_or(Error::DecodeInvalid("sub-item outside its structure"))?;
                let inner = Shape {
                    kind: sub.data_type_id,
                    type_name: &sub.type_name,
                    size: sub.size,
                    dims: &sub.array_dims,
                };
                let value = decode_shape(&inner, types, &data[sub.offset as usize..end as usize])?;
                items.push((sub.name.clone(), value));
            }
            Ok(Value::Struct(items))
        }
        _ => Ok(Value::Blob(need(data, shape.size as usize)?.to_vec())),
    }
}

fn encode_shape(shape: &Shape, types: &TypeMap, value: &Value) -> Result<Vec<u8>> {
    if let Some((&(_, length), rest)) = shape.dims.split_first() {
        let elems = match value {
            Value::Array(elems) => elems,
            other => return Err(mismatch("array value", other)),
        };
        if elems.len() != length as usize {
            return Err(Error::ArrayShapeMismatch { expected: length, got: elems.len() });
        }
        if length == 0 {
            return Err(Error::DecodeInvalid("array dimension of length zero"));
        }
        let chunk = shape.size / length;
        let mut out = Vec::with_capacity(shape.size as usize);
        for elem in elems {
            let inner = Shape { size: chunk, dims: rest, ..*shape };
            out.extend_from_slice(&encode_shape(&inner, types, elem)?);
        }
        return Ok(out);
    }

    match shape.kind {
        adst::BIT => match value {
            Value::Bool(b) => Ok(vec![u8::from(*b)]),
            other => Err(mismatch("BOOL value", other)),
        },
        adst::INT8 => match value {
            Value::Int8(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("SINT value", other)),
        },
        adst::UINT8 => match value {
            Value::UInt8(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("USINT value", other)),
        },
        adst::INT16 => match value {
            Value::Int16(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("INT value", other)),
        },
        adst::UINT16 => match value {
            Value::UInt16(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("UINT value", other)),
        },
        adst::INT32 => match value {
            Value::Int32(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("DINT value", other)),
        },
        adst::UINT32 => match value {
            Value::UInt32(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("UDINT value", other)),
        },
        adst::INT64 => match value {
            Value::Int64(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("LINT value", other)),
        },
        adst::UINT64 => match value {
            Value::UInt64(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("ULINT value", other)),
        },
        adst::REAL32 => match value {
            Value::Real32(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("REAL value", other)),
        },
        adst::REAL64 => match value {
            Value::Real64(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(mismatch("LREAL value", other)),
        },
        adst::REAL80 => Err(Error::UnsupportedType("REAL80".into())),
        adst::VOID => Err(Error::UnsupportedType("VOID (pointer) write".into())),
        adst::STRING | adst::WSTRING => match value {
            Value::String(s) => encode_string(s, shape.size),
            other => Err(mismatch("STRING value", other)),
        },
        adst::BIGTYPE => encode_bigtype(shape, types, value),
        _ => Err(Error::UnsupportedType(format!("type tag {}", shape.kind))),
    }
}

fn encode_bigtype(shape: &Shape, types: &TypeMap, value: &Value) -> Result<Vec<u8>> {
    if DATE_NAMES.contains(&shape.type_name) {
        let ts = match value {
            Value::Timestamp(ts) => ts,
            other => return Err(mismatch("timestamp value", other)),
        };
        let secs = u32::try_from(ts.timestamp())
            .map_err(|_| Error::UnsupportedType("timestamp outside DATE range".into()))?;
        return Ok(secs.to_le_bytes().to_vec());
    }
    if TOD_NAMES.contains(&shape.type_name) {
        // Only the HH:MM rendering exists on the read side; there is no
        // faithful way back to milliseconds-since-midnight.
        return Err(Error::UnsupportedType(shape.type_name.into()));
    }

    match types.get(shape.type_name) {
        Some(dt) if !dt.array_dims.is_empty() => {
            let inner = Shape {
                kind: dt.data_type_id,
                type_name: &dt.type_name,
                size: dt.size,
                dims: &dt.array_dims,
            };
            encode_shape(&inner, types, value)
        }
        Some(dt) if !dt.sub_items.is_empty() => {
            let items = match value {
                Value::Struct(items) => items,
                other => return Err(mismatch("structure value", other)),
            };
            if items.len() != dt.sub_items.len() {
                return Err(Error::StructureShapeMismatch(dt.name.clone()));
            }
            let mut out = vec![0; dt.size as usize];
            for sub in &dt.sub_items {
                let value = items
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(&sub.name))
                    .map(|(_, v)| v)
                    .ok_or_else(|| Error::StructureShapeMismatch(dt.name.clone()))?;
                let inner = Shape {
                    kind: sub.data_type_id,
                    type_name: &sub.type_name,
                    size: sub.size,
                    dims: &sub.array_dims,
                };
                let bytes = encode_shape(&inner, types, value)?;
                let end = sub
                    .offset
                    .checked_add(sub.size)
                    .filter(|&end| end as usize <= out.len())
                    .ok_or(Error::DecodeInvalid("sub-item outside its structure"))?;
                out[sub.offset as usize..end as usize].copy_from_slice(&bytes);
            }
            Ok(out)
        }
        _ => Err(Error::UnsupportedType(shape.type_name.into())),
    }
}

fn encode_string(s: &str, size: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size as usize);
    for ch in s.chars() {
        let code = ch as u32;
        if code > 0xFF {
            return Err(Error::UnsupportedType("non latin-1 character in string".into()));
        }
        out.push(code as u8);
    }
    if out.len() > size as usize {
        return Err(Error::SizeMismatch { context: "encoding string", expected: size, got: out.len() });
    }
    out.resize(size as usize, 0);
    Ok(out)
}

fn latin1_until_nul(raw: &[u8]) -> String {
    raw.iter().take_while(|&&b| b != 0).map(|&b| b as char).collect()
}

fn mismatch(expected: &'static str, got: &Value) -> Error {
    Error::UnsupportedType(format!("expected {expected}, got {got:?}"))
}

const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Convert a Windows FILETIME (100 ns ticks since 1601-01-01 UTC) to an
/// instant.  Ticks before the Unix epoch clamp to it.
pub fn filetime_to_utc(ticks: u64) -> DateTime<Utc> {
    let since_epoch = ticks.saturating_sub(FILETIME_UNIX_EPOCH);
    let secs = (since_epoch / 10_000_000) as i64;
    let nanos = (since_epoch % 10_000_000) as u32 * 100;
    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn unix_secs_to_utc(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Render milliseconds-since-midnight as `HH:MM`.
///
/// The milliseconds are deliberately interpreted through the host's local
/// zone, matching what existing PLC displays show.
pub(crate) fn time_of_day_string(millis: u32) -> Result<String> {
    Local
        .timestamp_millis_opt(millis as i64)
        .single()
        .map(|dt| dt.format("%H:%M").to_string())
        .ok_or(Error::DecodeInvalid("time of day"))
}

//! Decoders for the runtime's self-describing symbol and data-type tables.
//!
//! The PLC exposes three uploads: `SYM_UPLOADINFO2` (counts and byte
//! lengths), `SYM_UPLOAD` (one record per symbol) and `SYM_DT_UPLOAD` (one
//! record per named type, with recursive sub-item records for structures).
//! All records are length-prefixed; both tables are decoded greedily and
//! trailing bytes that do not form a complete record are ignored.

use std::collections::HashMap;

use byteorder::{ReadBytesExt, LE};

use crate::errors::ErrContext;
use crate::{Error, Result};

/// A named PLC variable with a fixed location.
///
/// Populated once per session from `SYM_UPLOAD`; invalidated on disconnect.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Index group of the symbol location.
    pub group: u32,
    /// Index offset of the symbol location.
    pub offset: u32,
    /// Total size in bytes.
    pub size: u32,
    /// Primitive type tag (see [`crate::value::adst`]).
    pub data_type_id: u32,
    /// Symbol flags (not further documented).
    pub flags: u32,
    /// Hierarchical name in original case.
    pub name: String,
    /// Upper-cased name, the case-insensitive lookup key.
    pub upper_name: String,
    /// Name of the symbol's type.
    pub type_name: String,
    /// Declaration comment, often empty.
    pub comment: String,
}

/// A named schema from the PLC's type inventory.
#[derive(Debug, Clone, Default)]
pub struct DataType {
    /// Record format version; 1 on current runtimes.
    pub version: u32,
    /// Hash of the type layout (not further documented).
    pub hash: u32,
    /// Hash of the base type (not further documented).
    pub type_hash: u32,
    /// Total size in bytes; for arrays, element size times all lengths.
    pub size: u32,
    /// Offset within the parent structure (sub-item records only).
    pub offset: u32,
    /// Primitive type tag; for arrays the tag of the element type.
    pub data_type_id: u32,
    /// Type flags (not further documented).
    pub flags: u32,
    /// Name of the type, or of the field for sub-item records.
    pub name: String,
    /// The element/base type name (for arrays and aliases).
    pub type_name: String,
    /// Declaration comment, often empty.
    pub comment: String,
    /// `(start, length)` per dimension, outermost first as on the wire.
    pub array_dims: Vec<(i32, u32)>,
    /// Structure fields, in declaration order.
    pub sub_items: Vec<DataType>,
}

/// Mapping from type name to type, in the table's original case.
pub type TypeMap = HashMap<String, DataType>;

/// The decoded tables of one session.
#[derive(Debug, Default)]
pub struct SymbolTables {
    /// Symbols keyed by upper-cased name.
    pub symbols: HashMap<String, Symbol>,
    /// Types keyed by name.
    pub types: TypeMap,
}

impl SymbolTables {
    /// Look up a symbol by its already upper-cased name.
    pub fn symbol(&self, upper_name: &str) -> Option<&Symbol> {
        self.symbols.get(upper_name)
    }
}

/// Counts and byte lengths of the two tables, from `SYM_UPLOADINFO2`.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct UploadInfo {
    pub symbol_count: u32,
    pub symbol_length: u32,
    pub data_type_count: u32,
    pub data_type_length: u32,
    pub extra_count: u32,
    pub extra_length: u32,
}

/// Decode the 24-byte `SYM_UPLOADINFO2` record.
pub fn decode_upload_info(mut data: &[u8]) -> Result<UploadInfo> {
    let ctx = "decoding upload info";
    Ok(UploadInfo {
        symbol_count: data.read_u32::<LE>().ctx(ctx)?,
        symbol_length: data.read_u32::<LE>().ctx(ctx)?,
        data_type_count: data.read_u32::<LE>().ctx(ctx)?,
        data_type_length: data.read_u32::<LE>().ctx(ctx)?,
        extra_count: data.read_u32::<LE>().ctx(ctx)?,
        extra_length: data.read_u32::<LE>().ctx(ctx)?,
    })
}

// Fixed part of a symbol record after the length prefix: five u32 plus
// three string lengths.
const SYMBOL_FIXED: usize = 5 * 4 + 3 * 2;
// Fixed part of a data-type record after the length prefix.
const DATA_TYPE_FIXED: usize = 7 * 4 + 5 * 2;

/// Decode a `SYM_UPLOAD` payload into a symbol dictionary keyed by
/// upper-cased name.
pub fn decode_symbols(data: &[u8]) -> Result<HashMap<String, Symbol>> {
    let ctx = "decoding symbol table";
    let mut symbols = HashMap::new();
    let mut rest = data;
    while rest.len() >= 4 {
        let mut head = &rest[..4];
        let entry_len = head.read_u32::<LE>().ctx(ctx)? as usize;
        if entry_len < 4 + SYMBOL_FIXED {
            return Err(Error::DecodeInvalid("symbol entry too short"));
        }
        if entry_len > rest.len() {
            break;
        }
        let mut entry = &rest[4..entry_len];
        let group = entry.read_u32::<LE>().ctx(ctx)?;
        let offset = entry.read_u32::<LE>().ctx(ctx)?;
        let size = entry.read_u32::<LE>().ctx(ctx)?;
        let data_type_id = entry.read_u32::<LE>().ctx(ctx)?;
        let flags = entry.read_u32::<LE>().ctx(ctx)?;
        let name_len = entry.read_u16::<LE>().ctx(ctx)? as usize;
        let type_len = entry.read_u16::<LE>().ctx(ctx)? as usize;
        let comment_len = entry.read_u16::<LE>().ctx(ctx)? as usize;
        let name = read_cstring(&mut entry, name_len)?;
        let type_name = read_cstring(&mut entry, type_len)?;
        let comment = read_cstring(&mut entry, comment_len)?;

        let upper_name = name.to_uppercase();
        symbols.insert(upper_name.clone(), Symbol {
            group,
            offset,
            size,
            data_type_id,
            flags,
            name,
            upper_name,
            type_name,
            comment,
        });
        rest = &rest[entry_len..];
    }
    Ok(symbols)
}

/// Decode a `SYM_DT_UPLOAD` payload into a type dictionary keyed by name.
pub fn decode_data_types(data: &[u8]) -> Result<TypeMap> {
    let mut types = HashMap::new();
    let mut rest = data;
    while rest.len() >= 4 {
        let mut head = &rest[..4];
        let entry_len = head.read_u32::<LE>().ctx("decoding type table")? as usize;
        if entry_len < 4 + DATA_TYPE_FIXED {
            return Err(Error::DecodeInvalid("data-type entry too short"));
        }
        if entry_len > rest.len() {
            break;
        }
        let dt = decode_type_entry(&rest[4..entry_len])?;
        types.insert(dt.name.clone(), dt);
        rest = &rest[entry_len..];
    }
    Ok(types)
}

// Decode one data-type record, its 4-byte length prefix already stripped.
// Sub-items are records of the same layout and recurse here.
fn decode_type_entry(mut entry: &[u8]) -> Result<DataType> {
    let ctx = "decoding type entry";
    let version = entry.read_u32::<LE>().ctx(ctx)?;
    let hash = entry.read_u32::<LE>().ctx(ctx)?;
    let type_hash = entry.read_u32::<LE>().ctx(ctx)?;
    let size = entry.read_u32::<LE>().ctx(ctx)?;
    let offset = entry.read_u32::<LE>().ctx(ctx)?;
    let data_type_id = entry.read_u32::<LE>().ctx(ctx)?;
    let flags = entry.read_u32::<LE>().ctx(ctx)?;
    let name_len = entry.read_u16::<LE>().ctx(ctx)? as usize;
    let type_len = entry.read_u16::<LE>().ctx(ctx)? as usize;
    let comment_len = entry.read_u16::<LE>().ctx(ctx)? as usize;
    let array_dim_count = entry.read_u16::<LE>().ctx(ctx)?;
    let sub_item_count = entry.read_u16::<LE>().ctx(ctx)?;
    let name = read_cstring(&mut entry, name_len)?;
    let type_name = read_cstring(&mut entry, type_len)?;
    let comment = read_cstring(&mut entry, comment_len)?;

    let mut array_dims = Vec::with_capacity(array_dim_count as usize);
    for _ in 0..array_dim_count {
        let start = entry.read_i32::<LE>().ctx(ctx)?;
        let length = entry.read_u32::<LE>().ctx(ctx)?;
        array_dims.push((start, length));
    }

    let mut sub_items = Vec::with_capacity(sub_item_count as usize);
    for _ in 0..sub_item_count {
        let sub_len = entry.read_u32::<LE>().ctx(ctx)? as usize;
        if sub_len < 4 + DATA_TYPE_FIXED {
            return Err(Error::DecodeInvalid("zero-length sub-item"));
        }
        if sub_len - 4 > entry.len() {
            return Err(Error::DecodeInvalid("sub-item outside its record"));
        }
        let (sub, rest) = entry.split_at(sub_len - 4);
        sub_items.push(decode_type_entry(sub)?);
        entry = rest;
    }

    Ok(DataType {
        version,
        hash,
        type_hash,
        size,
        offset,
        data_type_id,
        flags,
        name,
        type_name,
        comment,
        array_dims,
        sub_items,
    })
}

fn read_cstring(entry: &mut &[u8], len: usize) -> Result<String> {
    // `len` characters plus the terminating NUL.
    if entry.len() < len + 1 {
        return Err(Error::DecodeInvalid("truncated string in table record"));
    }
    let s = String::from_utf8_lossy(&entry[..len]).into_owned();
    *entry = &entry[len + 1..];
    Ok(s)
}

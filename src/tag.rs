//! Tag paths: parsing `.Program.Var[3].Field` and resolving it against the
//! uploaded tables to a readable/writable address.

use crate::symbol::SymbolTables;
use crate::{Error, Result};

/// A resolved tag: enough to issue a read or write and to drive the value
/// codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindTag {
    /// Index group of the addressed bytes.
    pub group: u32,
    /// Index offset of the addressed bytes.
    pub offset: u32,
    /// Number of addressed bytes.
    pub size: u32,
    /// Name of the value's type (element type after indexing).
    pub type_name: String,
    /// Primitive type tag driving codec dispatch.
    pub kind: u32,
}

// One `NAME[i][j]` piece of a dotted path, name upper-cased.
#[derive(Debug, PartialEq, Eq)]
struct Segment {
    name: String,
    indices: Vec<i32>,
}

// Split a path on dots and pull bracketed indices off each piece.  The
// first piece may be empty (leading dot of a global variable).
fn parse_segments(path: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for (i, piece) in path.split('.').enumerate() {
        let (name, mut rest) = match piece.find('[') {
            Some(pos) => piece.split_at(pos),
            None => (piece, ""),
        };
        if name.is_empty() && !(i == 0 && rest.is_empty()) {
            return Err(Error::TagPath(format!("empty segment in {path:?}")));
        }
        let mut indices = Vec::new();
        while !rest.is_empty() {
            let inner = rest
                .strip_prefix('[')
                .and_then(|r| r.split_once(']'))
                .ok_or_else(|| Error::TagPath(format!("malformed index in {path:?}")))?;
            let idx = inner.0.trim().parse::<i32>().map_err(|_| {
                Error::TagPath(format!("non-numeric index {:?} in {path:?}", inner.0))
            })?;
            indices.push(idx);
            rest = inner.1;
        }
        segments.push(Segment { name: name.to_uppercase(), indices });
    }
    if segments.len() < 2 {
        return Err(Error::TagPath(format!("{path:?} does not name a symbol")));
    }
    Ok(segments)
}

/// Resolve a dotted tag path against the session's tables.
///
/// The first two segments form the symbol key; with a leading dot the first
/// segment is empty and the key is a global-variable name like `.ARRALARM`.
/// Remaining segments walk sub-items of the symbol's type.  Names compare
/// case-insensitively throughout.
pub fn find_tag(path: &str, tables: &SymbolTables) -> Result<FindTag> {
    let segments = parse_segments(path)?;
    let key = format!("{}.{}", segments[0].name, segments[1].name);
    if !segments[0].indices.is_empty() {
        return Err(Error::TagPath(format!("index before variable name in {path:?}")));
    }

    let symbol = tables.symbol(&key).ok_or_else(|| Error::SymbolNotFound(key.clone()))?;
    let mut tag = FindTag {
        group: symbol.group,
        offset: symbol.offset,
        size: symbol.size,
        type_name: symbol.type_name.clone(),
        kind: symbol.data_type_id,
    };
    // May be absent for primitive-typed symbols.
    let mut current = tables.types.get(&symbol.type_name);

    if !segments[1].indices.is_empty() {
        let ct = current
            .filter(|t| !t.array_dims.is_empty())
            .ok_or_else(|| Error::ArrayDimensionMismatch(tag.type_name.clone()))?;
        fold_indices(&mut tag, &ct.array_dims, &segments[1].indices)?;
        tag.type_name = ct.type_name.clone();
        tag.kind = ct.data_type_id;
        current = tables.types.get(&tag.type_name);
    }

    for segment in &segments[2..] {
        let ct = current.ok_or_else(|| Error::SubItemNotFound(segment.name.clone()))?;
        let sub = ct
            .sub_items
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(&segment.name))
            .ok_or_else(|| Error::SubItemNotFound(segment.name.clone()))?;
        tag.offset += sub.offset;
        tag.size = sub.size;
        tag.type_name = sub.type_name.clone();
        tag.kind = sub.data_type_id;
        if !segment.indices.is_empty() {
            if sub.array_dims.is_empty() {
                return Err(Error::ArrayDimensionMismatch(sub.name.clone()));
            }
            fold_indices(&mut tag, &sub.array_dims, &segment.indices)?;
        }
        current = tables.types.get(&tag.type_name);
    }
    Ok(tag)
}

// Fold bracket indices into offset and size.  Indices arrive in path order
// and pair with the dimension list from its tail: the k-th supplied index
// uses `dims[len - 1 - k]`.  Each step divides the size by the dimension
// length and advances the offset by the selected slot.
fn fold_indices(tag: &mut FindTag, dims: &[(i32, u32)], indices: &[i32]) -> Result<()> {
    if indices.len() > dims.len() {
        return Err(Error::ArrayDimensionMismatch(tag.type_name.clone()));
    }
    for (k, &index) in indices.iter().enumerate() {
        let (start, length) = dims[dims.len() - 1 - k];
        if length == 0 {
            return Err(Error::DecodeInvalid("array dimension of length zero"));
        }
        let slot = index as i64 - start as i64;
        if slot < 0 || slot >= length as i64 {
            return Err(Error::IndexOutOfBounds { index, start, length });
        }
        tag.size /= length;
        tag.offset += tag.size * slot as u32;
    }
    Ok(())
}

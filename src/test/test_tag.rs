// Tests for tag-path parsing and resolution.

use crate::symbol::{decode_data_types, decode_symbols, SymbolTables};
use crate::tag::find_tag;
use crate::testing;
use crate::value::adst;
use crate::Error;

fn tables() -> SymbolTables {
    SymbolTables {
        symbols: decode_symbols(&testing::test_symbol_table()).unwrap(),
        types: decode_data_types(&testing::test_type_table()).unwrap(),
    }
}

#[test]
fn resolve_primitive_symbol() {
    let tag = find_tag(".bTest", &tables()).unwrap();
    assert_eq!(tag.group, 0x4040);
    assert_eq!(tag.offset, 0x10);
    assert_eq!(tag.size, 1);
    assert_eq!(tag.kind, adst::BIT);
    assert_eq!(tag.type_name, "BOOL");
}

#[test]
fn resolve_is_case_insensitive() {
    let tag = find_tag(".ArRaLaRm[1]", &tables()).unwrap();
    assert_eq!(tag.offset, 0x20);
    assert_eq!(tag.size, 1);
    assert_eq!(tag.kind, adst::BIT);
}

#[test]
fn array_index_addresses_the_element() {
    // ARRAY [1..2] OF BOOL at 0x20: element [2] is one byte further.
    let tag = find_tag(".arrAlarm[2]", &tables()).unwrap();
    assert_eq!((tag.group, tag.offset, tag.size), (0x4040, 0x21, 1));
    assert_eq!(tag.kind, adst::BIT);
    assert_eq!(tag.type_name, "BOOL");
}

#[test]
fn unindexed_array_stays_composite() {
    let tag = find_tag(".arrAlarm", &tables()).unwrap();
    assert_eq!(tag.size, 2);
    assert_eq!(tag.kind, adst::BIGTYPE);
    assert_eq!(tag.type_name, "ARRAY [1..2] OF BOOL");
}

#[test]
fn structure_field_accumulates_offset() {
    let tag = find_tag(".larm.IBJFB_FRYS", &tables()).unwrap();
    assert_eq!((tag.offset, tag.size), (0x31, 1));
    assert_eq!(tag.kind, adst::BIT);

    let tag = find_tag(".Larm.ibjfb_utomhus", &tables()).unwrap();
    assert_eq!(tag.offset, 0x32);
}

#[test]
fn multi_dimensional_indices_pair_innermost_first() {
    // grid is ARRAY [0..1, 1..3] OF INT at 0x70, 12 bytes.  A single
    // index consumes the innermost dimension.
    let tag = find_tag("Main.grid[3]", &tables()).unwrap();
    assert_eq!((tag.offset, tag.size), (0x78, 4));

    // With both indices the first one is the innermost.
    let tag = find_tag("MAIN.GRID[2][1]", &tables()).unwrap();
    assert_eq!((tag.offset, tag.size), (0x76, 2));
    assert_eq!(tag.kind, adst::INT16);
}

#[test]
fn index_bounds_follow_the_declared_start() {
    assert!(matches!(
        find_tag(".arrAlarm[0]", &tables()),
        Err(Error::IndexOutOfBounds { index: 0, start: 1, length: 2 })
    ));
    assert!(matches!(
        find_tag(".arrAlarm[3]", &tables()),
        Err(Error::IndexOutOfBounds { index: 3, .. })
    ));
}

#[test]
fn resolver_errors() {
    assert!(matches!(find_tag(".missing", &tables()), Err(Error::SymbolNotFound(_))));
    assert!(matches!(find_tag(".larm.NOPE", &tables()), Err(Error::SubItemNotFound(_))));
    assert!(matches!(find_tag(".bTest.sub", &tables()), Err(Error::SubItemNotFound(_))));
    // More indices than dimensions.
    assert!(matches!(
        find_tag(".arrAlarm[1][1]", &tables()),
        Err(Error::ArrayDimensionMismatch(_))
    ));
    // Indexing a scalar.
    assert!(matches!(find_tag(".counter[1]", &tables()), Err(Error::ArrayDimensionMismatch(_))));
}

#[test]
fn path_syntax_errors() {
    assert!(matches!(find_tag("bTest", &tables()), Err(Error::TagPath(_))));
    assert!(matches!(find_tag(".arrAlarm[x]", &tables()), Err(Error::TagPath(_))));
    assert!(matches!(find_tag(".arrAlarm[1", &tables()), Err(Error::TagPath(_))));
    assert!(matches!(find_tag(".arrAlarm[1]junk", &tables()), Err(Error::TagPath(_))));
    assert!(matches!(find_tag(".larm..x", &tables()), Err(Error::TagPath(_))));
    assert!(matches!(find_tag("", &tables()), Err(Error::TagPath(_))));
}

//! Well-known index groups as defined
//! [here](https://infosys.beckhoff.com/content/1033/tc3_ads_intro/117241867.html?id=1944752650545554679).

/// PLC: Read/write PLC memory (%M fields).
pub const PLC_RW_M: u32 = 0x4020;
/// PLC: Read/write PLC memory as bits (%MX fields).  Offset is (byte*8 + bit) address.
pub const PLC_RW_MX: u32 = 0x4021;
/// PLC: Read/write retain data area.
pub const PLC_RW_RB: u32 = 0x4030;
/// PLC: Read/write data area.
pub const PLC_RW_DB: u32 = 0x4040;

/// System service: Read/write process image of physical inputs (%I fields).
pub const SYS_RW_I: u32 = 0xF020;
/// System service: Read/write process image of physical outputs (%Q fields).
pub const SYS_RW_Q: u32 = 0xF030;

/// System service: Upload the symbol table.  Read `symbol_length` bytes at offset 0.
pub const SYS_SYM_UPLOAD: u32 = 0xF00B;
/// System service: Upload the data-type table.  Read `data_type_length` bytes at offset 0.
pub const SYS_SYM_DT_UPLOAD: u32 = 0xF00E;
/// System service: Read counts and byte lengths of the symbol and data-type
/// tables (24-byte record at offset 0).
pub const SYS_SYM_UPLOAD_INFO2: u32 = 0xF00F;
/// System service: Get a u32 handle for the symbol name in the write data.
pub const SYS_GET_SYMHANDLE_BYNAME: u32 = 0xF003;
/// System service: Read/write a symbol's value by handle.
pub const SYS_RW_SYMVAL_BYHANDLE: u32 = 0xF005;
/// System service: Release a symbol handle.
pub const SYS_RELEASE_SYMHANDLE: u32 = 0xF006;

// In-process ADS server used by the crate test suite.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use once_cell::sync::Lazy;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::client::AdsState;
use crate::symbol::DataType;
use crate::value::adst;

// Writing to this index group makes the server drop the TCP connection
// without replying; used to provoke reconnects.
pub const DROP_GROUP: u32 = 0xDEAD;

// FILETIME for 2020-09-13T12:26:40Z (unix 1_600_000_000), stamped on every
// pushed notification.
pub const NOTIF_FILETIME: u64 = 116_444_736_000_000_000 + 1_600_000_000 * 10_000_000;

// Since Cargo tests run multi-threaded, start one server per thread and
// handle clients from the test functions in that thread.
thread_local! {
    pub static SERVER: Lazy<(u16, Arc<Mutex<ServerOpts>>)> = Lazy::new(|| {
        let opts = Arc::new(Mutex::new(ServerOpts::default()));

        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let opts_server = opts.clone();
        thread::spawn(move || {
            let mut server = Server {
                opts: opts_server,
                data: vec![0; 0x100],
                state: (AdsState::Run, 0),
                next_handle: 1,
                notifs: HashMap::new(),
            };
            for client in socket.incoming().flatten() {
                // One client at a time is all the tests need; a dropped
                // connection loops back here, which is what the
                // reconnect tests rely on.
                server.handle_client(client);
            }
        });

        (port, opts)
    });
}

// Configures different ways the server should behave.
#[derive(Default)]
pub struct ServerOpts {
    // Swallow every request without replying.
    pub no_reply: bool,
}

pub fn config_test_server(opts: ServerOpts) -> u16 {
    SERVER.with(|obj| {
        let (port, server_opts) = &**obj;
        *server_opts.lock().unwrap() = opts;
        *port
    })
}

struct Server {
    opts: Arc<Mutex<ServerOpts>>,
    data: Vec<u8>,
    state: (AdsState, u16),
    next_handle: u32,
    // handle -> (offset, length) into the data area
    notifs: HashMap<u32, (usize, usize)>,
}

impl Server {
    fn handle_client(&mut self, mut socket: TcpStream) {
        loop {
            let mut header = TestHeader::new_zeroed();
            if socket.read_exact(header.as_mut_bytes()).is_err() {
                // connection was closed
                return;
            }
            let mut data = vec![0; header.data_len.get() as usize];
            socket.read_exact(&mut data).unwrap();

            if self.opts.lock().unwrap().no_reply {
                continue;
            }

            let mut push_notif = None;
            let (reply_data, error) = match header.cmd.get() {
                1 => self.do_devinfo(&data),
                2 => self.do_read(&data),
                3 => match self.do_write(&data) {
                    None => return, // drop-group write: cut the connection
                    Some(reply) => reply,
                },
                4 => self.do_read_state(&data),
                5 => self.do_write_control(&data),
                6 => {
                    let (reply, error, handle) = self.do_add_notif(&data);
                    push_notif = handle;
                    (reply, error)
                }
                7 => self.do_del_notif(&data),
                _ => (vec![], 0x701),
            };

            let mut reply_header = TestHeader::new_zeroed();
            reply_header.len.set(32 + reply_data.len() as u32);
            reply_header.dst_addr = header.src_addr;
            reply_header.dst_port = header.src_port;
            reply_header.src_addr = header.dst_addr;
            reply_header.src_port = header.dst_port;
            reply_header.cmd = header.cmd;
            reply_header.state.set(header.state.get() | 1);
            reply_header.data_len.set(reply_data.len() as u32);
            reply_header.error.set(error);
            reply_header.inv_id = header.inv_id;

            socket.write_all(reply_header.as_bytes()).unwrap();
            socket.write_all(&reply_data).unwrap();

            // A fresh subscription is greeted with the current value.
            if let Some(handle) = push_notif {
                self.push_notification(&mut socket, &header, handle);
            }
        }
    }

    fn push_notification(&self, socket: &mut TcpStream, request: &TestHeader, handle: u32) {
        let (offset, length) = self.notifs[&handle];
        let sample = &self.data[offset..offset + length];

        let mut body = vec![];
        body.write_u32::<LE>((4 + 8 + 4 + 4 + 4 + sample.len()) as u32).unwrap();
        body.write_u32::<LE>(1).unwrap(); // stamps
        body.write_u64::<LE>(NOTIF_FILETIME).unwrap();
        body.write_u32::<LE>(1).unwrap(); // samples
        body.write_u32::<LE>(handle).unwrap();
        body.write_u32::<LE>(sample.len() as u32).unwrap();
        body.extend_from_slice(sample);

        let mut header = TestHeader::new_zeroed();
        header.len.set(32 + body.len() as u32);
        header.dst_addr = request.src_addr;
        header.dst_port = request.src_port;
        header.src_addr = request.dst_addr;
        header.src_port = request.dst_port;
        header.cmd.set(8);
        header.state.set(4);
        header.data_len.set(body.len() as u32);

        socket.write_all(header.as_bytes()).unwrap();
        socket.write_all(&body).unwrap();
    }

    fn do_devinfo(&self, data: &[u8]) -> (Vec<u8>, u32) {
        if !data.is_empty() {
            return (vec![], 0x706);
        }
        // no error, major 3, minor 1
        let mut out = vec![0, 0, 0, 0, 3, 1];
        out.write_u16::<LE>(4024).unwrap();
        out.extend(b"Plc30 App\0\0\0\0\0\0\0");
        (out, 0)
    }

    fn do_read_state(&self, data: &[u8]) -> (Vec<u8>, u32) {
        if !data.is_empty() {
            return (vec![], 0x706);
        }
        let mut out = vec![0, 0, 0, 0];
        out.write_u16::<LE>(self.state.0 as u16).unwrap();
        out.write_u16::<LE>(self.state.1).unwrap();
        (out, 0)
    }

    fn do_write_control(&mut self, mut data: &[u8]) -> (Vec<u8>, u32) {
        if data.len() != 8 {
            return (vec![], 0x706);
        }
        let adsstate = data.read_u16::<LE>().unwrap();
        let devstate = data.read_u16::<LE>().unwrap();
        let mut out = vec![];
        match AdsState::try_from(adsstate) {
            Err(_) | Ok(AdsState::Invalid) => {
                out.write_u32::<LE>(0x70B).unwrap();
            }
            Ok(adsstate) => {
                self.state = (adsstate, devstate);
                out.write_u32::<LE>(0).unwrap();
            }
        }
        (out, 0)
    }

    fn do_read(&self, data: &[u8]) -> (Vec<u8>, u32) {
        let mut ptr = data;
        let Ok(igrp) = ptr.read_u32::<LE>() else { return (vec![], 0x706) };
        let Ok(ioff) = ptr.read_u32::<LE>() else { return (vec![], 0x706) };
        let Ok(len) = ptr.read_u32::<LE>() else { return (vec![], 0x706) };

        let payload = match igrp {
            crate::index::SYS_SYM_UPLOAD_INFO2 => test_upload_info(),
            crate::index::SYS_SYM_UPLOAD => test_symbol_table(),
            crate::index::SYS_SYM_DT_UPLOAD => test_type_table(),
            crate::index::PLC_RW_DB => {
                let (off, len) = (ioff as usize, len as usize);
                if off + len > self.data.len() {
                    return (vec![], 0x703);
                }
                self.data[off..off + len].to_vec()
            }
            _ => return (vec![], 0x702),
        };
        let payload = if payload.len() > len as usize { payload[..len as usize].to_vec() } else { payload };
        let mut ret = Vec::new();
        ret.write_u32::<LE>(0).unwrap();
        ret.write_u32::<LE>(payload.len() as u32).unwrap();
        ret.extend(payload);
        (ret, 0)
    }

    // None means: drop the connection without replying.
    fn do_write(&mut self, data: &[u8]) -> Option<(Vec<u8>, u32)> {
        let mut ptr = data;
        let Ok(igrp) = ptr.read_u32::<LE>() else { return Some((vec![], 0x706)) };
        let Ok(ioff) = ptr.read_u32::<LE>() else { return Some((vec![], 0x706)) };
        let Ok(len) = ptr.read_u32::<LE>() else { return Some((vec![], 0x706)) };

        if igrp == DROP_GROUP {
            return None;
        }
        if igrp != crate::index::PLC_RW_DB {
            return Some((vec![], 0x702));
        }
        let (off, len) = (ioff as usize, len as usize);
        if off + len > self.data.len() {
            return Some((vec![], 0x703));
        }
        if ptr.len() != len {
            return Some((vec![], 0x706));
        }
        self.data[off..off + len].copy_from_slice(ptr);
        Some((vec![0, 0, 0, 0], 0))
    }

    fn do_add_notif(&mut self, data: &[u8]) -> (Vec<u8>, u32, Option<u32>) {
        if data.len() != 40 {
            return (vec![], 0x706, None);
        }
        let mut ptr = data;
        let igrp = ptr.read_u32::<LE>().unwrap();
        let ioff = ptr.read_u32::<LE>().unwrap();
        let len = ptr.read_u32::<LE>().unwrap();
        if igrp != crate::index::PLC_RW_DB || (ioff + len) as usize > self.data.len() {
            return (vec![], 0x702, None);
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.notifs.insert(handle, (ioff as usize, len as usize));

        let mut out = vec![0, 0, 0, 0];
        out.write_u32::<LE>(handle).unwrap();
        (out, 0, Some(handle))
    }

    fn do_del_notif(&mut self, data: &[u8]) -> (Vec<u8>, u32) {
        if data.len() != 4 {
            return (vec![], 0x706);
        }
        let handle = u32::from_le_bytes(data.try_into().unwrap());
        let mut out = vec![];
        if self.notifs.remove(&handle).is_some() {
            out.write_u32::<LE>(0).unwrap();
        } else {
            out.write_u32::<LE>(0x714).unwrap();
        }
        (out, 0)
    }
}

#[derive(FromBytes, IntoBytes, Immutable, Debug)]
#[repr(C)]
struct TestHeader {
    pad: u16,
    len: U32,
    dst_addr: [u8; 6],
    dst_port: U16,
    src_addr: [u8; 6],
    src_port: U16,
    cmd: U16,
    state: U16,
    data_len: U32,
    error: U32,
    inv_id: U32,
}

// ---------------------------------------------------------------------
// Canned PLC image shared by the server and the decoder tests.

// Serialize one symbol record in SYM_UPLOAD layout.
pub fn encode_symbol_entry(
    group: u32, offset: u32, size: u32, data_type_id: u32, name: &str, type_name: &str,
    comment: &str,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u32::<LE>(group).unwrap();
    body.write_u32::<LE>(offset).unwrap();
    body.write_u32::<LE>(size).unwrap();
    body.write_u32::<LE>(data_type_id).unwrap();
    body.write_u32::<LE>(0).unwrap(); // flags
    body.write_u16::<LE>(name.len() as u16).unwrap();
    body.write_u16::<LE>(type_name.len() as u16).unwrap();
    body.write_u16::<LE>(comment.len() as u16).unwrap();
    for s in [name, type_name, comment] {
        body.extend_from_slice(s.as_bytes());
        body.push(0);
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    out.write_u32::<LE>(body.len() as u32 + 4).unwrap();
    out.extend(body);
    out
}

// Serialize one data-type record (recursively) in SYM_DT_UPLOAD layout.
pub fn encode_type_entry(dt: &DataType) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u32::<LE>(dt.version).unwrap();
    body.write_u32::<LE>(dt.hash).unwrap();
    body.write_u32::<LE>(dt.type_hash).unwrap();
    body.write_u32::<LE>(dt.size).unwrap();
    body.write_u32::<LE>(dt.offset).unwrap();
    body.write_u32::<LE>(dt.data_type_id).unwrap();
    body.write_u32::<LE>(dt.flags).unwrap();
    body.write_u16::<LE>(dt.name.len() as u16).unwrap();
    body.write_u16::<LE>(dt.type_name.len() as u16).unwrap();
    body.write_u16::<LE>(dt.comment.len() as u16).unwrap();
    body.write_u16::<LE>(dt.array_dims.len() as u16).unwrap();
    body.write_u16::<LE>(dt.sub_items.len() as u16).unwrap();
    for s in [&dt.name, &dt.type_name, &dt.comment] {
        body.extend_from_slice(s.as_bytes());
        body.push(0);
    }
    for &(start, length) in &dt.array_dims {
        body.write_i32::<LE>(start).unwrap();
        body.write_u32::<LE>(length).unwrap();
    }
    for sub in &dt.sub_items {
        body.extend(encode_type_entry(sub));
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    out.write_u32::<LE>(body.len() as u32 + 4).unwrap();
    out.extend(body);
    out
}

fn plain_type(name: &str, type_name: &str, size: u32, data_type_id: u32) -> DataType {
    DataType {
        version: 1,
        size,
        data_type_id,
        name: name.into(),
        type_name: type_name.into(),
        ..DataType::default()
    }
}

fn sub_item(name: &str, type_name: &str, offset: u32, size: u32, data_type_id: u32) -> DataType {
    DataType { offset, ..plain_type(name, type_name, size, data_type_id) }
}

// The type inventory the test server reports.
pub fn test_types() -> Vec<DataType> {
    let mut alarm_array = plain_type("ARRAY [1..2] OF BOOL", "BOOL", 2, adst::BIT);
    alarm_array.array_dims = vec![(1, 2)];

    let mut grid = plain_type("ARRAY [0..1, 1..3] OF INT", "INT", 12, adst::INT16);
    grid.array_dims = vec![(0, 2), (1, 3)];

    let mut alarms = plain_type("ST_ALARMS", "ST_ALARMS", 3, adst::BIGTYPE);
    alarms.sub_items = vec![
        sub_item("IBJFB_KYL", "BOOL", 0, 1, adst::BIT),
        sub_item("IBJFB_FRYS", "BOOL", 1, 1, adst::BIT),
        sub_item("IBJFB_UTOMHUS", "BOOL", 2, 1, adst::BIT),
    ];

    vec![
        plain_type("BOOL", "BOOL", 1, adst::BIT),
        plain_type("INT", "INT", 2, adst::INT16),
        alarm_array,
        grid,
        alarms,
    ]
}

// The symbols the test server exposes, all in the PLC data area.
pub fn test_symbols() -> Vec<Vec<u8>> {
    vec![
        encode_symbol_entry(crate::index::PLC_RW_DB, 0x10, 1, adst::BIT, ".bTest", "BOOL", ""),
        encode_symbol_entry(
            crate::index::PLC_RW_DB, 0x20, 2, adst::BIGTYPE, ".arrAlarm",
            "ARRAY [1..2] OF BOOL", "",
        ),
        encode_symbol_entry(
            crate::index::PLC_RW_DB, 0x30, 3, adst::BIGTYPE, ".larm", "ST_ALARMS",
            "alarm states",
        ),
        encode_symbol_entry(crate::index::PLC_RW_DB, 0x40, 2, adst::INT16, ".counter", "INT", ""),
        encode_symbol_entry(crate::index::PLC_RW_DB, 0x48, 8, adst::REAL64, ".setpoint", "LREAL", ""),
        encode_symbol_entry(crate::index::PLC_RW_DB, 0x50, 21, adst::STRING, ".name", "STRING(20)", ""),
        encode_symbol_entry(
            crate::index::PLC_RW_DB, 0x70, 12, adst::BIGTYPE, "Main.grid",
            "ARRAY [0..1, 1..3] OF INT", "",
        ),
    ]
}

pub fn test_symbol_table() -> Vec<u8> {
    test_symbols().concat()
}

pub fn test_type_table() -> Vec<u8> {
    test_types().iter().map(|dt| encode_type_entry(dt)).collect::<Vec<_>>().concat()
}

fn test_upload_info() -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LE>(test_symbols().len() as u32).unwrap();
    out.write_u32::<LE>(test_symbol_table().len() as u32).unwrap();
    out.write_u32::<LE>(test_types().len() as u32).unwrap();
    out.write_u32::<LE>(test_type_table().len() as u32).unwrap();
    out.write_u32::<LE>(0).unwrap();
    out.write_u32::<LE>(0).unwrap();
    out
}

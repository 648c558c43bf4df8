//! AMS/TCP framing: request encoding and incremental response decoding.
//!
//! Every packet on the wire is a 6-byte AMS/TCP prelude (two reserved bytes
//! plus the length of the rest) followed by the 32-byte AMS header and the
//! command payload.  [`drain`] consumes whole packets from an append-only
//! receive buffer and leaves partial frames for the next read.

use byteorder::{ByteOrder, ReadBytesExt, LE};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::errors::ErrContext;
use crate::notif;
use crate::{Error, Result};

/// Size of the AMS/TCP prelude.
pub(crate) const AMS_TCP_HEADER_SIZE: usize = 6;
/// Size of the AMS header proper.
pub(crate) const AMS_HEADER_SIZE: usize = 32;
/// Prelude + AMS header.
pub(crate) const FRAME_HEADER_SIZE: usize = AMS_TCP_HEADER_SIZE + AMS_HEADER_SIZE;

/// State flags of a command request.
pub(crate) const STATE_FLAGS_REQUEST: u16 = 0x0004;
/// State flags of a command response (request flag | response bit).
pub(crate) const STATE_FLAGS_RESPONSE: u16 = 0x0005;

/// An ADS protocol command.
// https://infosys.beckhoff.com/content/1033/tc3_ads_intro/115847307.html?id=7738940192708835096
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Return device info
    DevInfo = 1,
    /// Read some data
    Read = 2,
    /// Write some data
    Write = 3,
    /// Read the ADS and device state
    ReadState = 4,
    /// Set the ADS and device state
    WriteControl = 5,
    /// Add a notification for a given index
    AddNotification = 6,
    /// Delete a notification by handle
    DeleteNotification = 7,
    /// Change occurred in a given notification, sent by the PLC only
    Notification = 8,
    /// Write some data, then read back some data
    /// (used as a poor-man's function call)
    ReadWrite = 9,
}

impl Command {
    pub(crate) fn action(self) -> &'static str {
        match self {
            Command::DevInfo => "get device info",
            Command::Read => "read data",
            Command::Write => "write data",
            Command::ReadState => "read state",
            Command::WriteControl => "write control",
            Command::AddNotification => "add notification",
            Command::DeleteNotification => "delete notification",
            Command::Notification => "notification",
            Command::ReadWrite => "write and read data",
        }
    }
}

impl TryFrom<u16> for Command {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => Self::DevInfo,
            2 => Self::Read,
            3 => Self::Write,
            4 => Self::ReadState,
            5 => Self::WriteControl,
            6 => Self::AddNotification,
            7 => Self::DeleteNotification,
            8 => Self::Notification,
            9 => Self::ReadWrite,
            other => return Err(Error::UnknownCommand(other)),
        })
    }
}

/// An AMS endpoint on the wire: the 6-byte NetID and the AMS port.
pub type AmsEndpoint = ([u8; 6], u16);

/// The 16-byte routing prefix of a session: target address then source
/// address.  Built once per TCP session and reused for every request.
#[derive(FromBytes, IntoBytes, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct RoutePrefix {
    pub dest_netid: [u8; 6],
    pub dest_port: U16,
    pub src_netid: [u8; 6],
    pub src_port: U16,
}

impl RoutePrefix {
    pub(crate) fn new(target: AmsEndpoint, source: AmsEndpoint) -> Self {
        Self {
            dest_netid: target.0,
            dest_port: U16::new(target.1),
            src_netid: source.0,
            src_port: U16::new(source.1),
        }
    }
}

/// The AMS/TCP prelude and AMS header, as laid out on the wire.
#[derive(FromBytes, IntoBytes, Immutable, Debug, Clone)]
#[repr(C)]
pub(crate) struct AmsHeader {
    /// 0x0 - ADS command
    /// 0x1 - close port
    /// 0x1000 - open port
    /// 0x1001 - note from router (router state changed)
    /// 0x1002 - get local netid
    pub ams_cmd: u16,
    /// Length of everything after the 6-byte prelude.
    pub length: U32,
    pub dest_netid: [u8; 6],
    pub dest_port: U16,
    pub src_netid: [u8; 6],
    pub src_port: U16,
    pub command: U16,
    /// 0x01 - response
    /// 0x04 - ADS command
    /// (further bits exist but are never seen on a client connection)
    pub state_flags: U16,
    pub data_length: U32,
    pub error_code: U32,
    pub invoke_id: U32,
}

/// Encode a complete request frame: prelude, AMS header, payload.
pub(crate) fn encode_request(
    route: &RoutePrefix, cmd: Command, invoke_id: u32, payload: &[u8],
) -> Result<Vec<u8>> {
    let header = AmsHeader {
        ams_cmd: 0,
        length: U32::new((AMS_HEADER_SIZE + payload.len()).try_into()?),
        dest_netid: route.dest_netid,
        dest_port: route.dest_port,
        src_netid: route.src_netid,
        src_port: route.src_port,
        command: U16::new(cmd as u16),
        state_flags: U16::new(STATE_FLAGS_REQUEST),
        data_length: U32::new(payload.len().try_into()?),
        error_code: U32::new(0),
        invoke_id: U32::new(invoke_id),
    };
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// One decoded packet from the server.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Endpoint the packet came from.
    pub source: AmsEndpoint,
    /// Endpoint the packet was sent to (should be our own).
    pub target: AmsEndpoint,
    /// The command this packet answers (or `Notification`).
    pub command: Command,
    /// State flags as received.
    pub state_flags: u16,
    /// AMS-level error code.
    pub error_code: u32,
    /// Correlation ID; 0 for notifications.
    pub invoke_id: u32,
    /// The command-specific payload.
    pub body: ResponseBody,
}

/// Typed payloads of the nine response shapes.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// Device name and version.
    DevInfo {
        /// The ADS result code.
        result: u32,
        /// Major version number.
        major: u8,
        /// Minor version number.
        minor: u8,
        /// Build/version number.
        version: u16,
        /// Device name.
        name: String,
    },
    /// Data read from an index group/offset.
    Read {
        /// The ADS result code.
        result: u32,
        /// The bytes read.
        data: Vec<u8>,
    },
    /// Write acknowledgement.
    Write {
        /// The ADS result code.
        result: u32,
    },
    /// ADS state and device state.
    ReadState {
        /// The ADS result code.
        result: u32,
        /// The ADS state.
        ads_state: u16,
        /// The device state.
        dev_state: u16,
    },
    /// State-change acknowledgement.
    WriteControl {
        /// The ADS result code.
        result: u32,
    },
    /// Freshly assigned notification handle.
    AddNotification {
        /// The ADS result code.
        result: u32,
        /// The assigned notification handle.
        handle: u32,
    },
    /// Handle-deletion acknowledgement.
    DeleteNotification {
        /// The ADS result code.
        result: u32,
    },
    /// Server-initiated change notification.
    Notification(notif::Notification),
    /// Data returned by a write/read round trip.
    ReadWrite {
        /// The ADS result code.
        result: u32,
        /// The bytes read.
        data: Vec<u8>,
    },
}

impl ResponseBody {
    /// The ADS result code carried in the payload (0 for notifications).
    pub fn result(&self) -> u32 {
        match self {
            ResponseBody::DevInfo { result, .. }
            | ResponseBody::Read { result, .. }
            | ResponseBody::Write { result }
            | ResponseBody::ReadState { result, .. }
            | ResponseBody::WriteControl { result }
            | ResponseBody::AddNotification { result, .. }
            | ResponseBody::DeleteNotification { result }
            | ResponseBody::ReadWrite { result, .. } => *result,
            ResponseBody::Notification(_) => 0,
        }
    }
}

/// Drain all complete packets from `buf`, leaving any partial frame behind.
///
/// Packets whose `ams_cmd` marks them as router service traffic are skipped;
/// a declared length below the AMS header size is a protocol error.
pub(crate) fn drain(buf: &mut Vec<u8>) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    loop {
        if buf.len() < AMS_TCP_HEADER_SIZE {
            break;
        }
        let declared = LE::read_u32(&buf[2..6]);
        if declared < AMS_HEADER_SIZE as u32 {
            return Err(Error::FrameTooShort(declared));
        }
        let total = AMS_TCP_HEADER_SIZE + declared as usize;
        if buf.len() < total {
            break;
        }
        let frame: Vec<u8> = buf.drain(..total).collect();
        let ams_cmd = LE::read_u16(&frame[..2]);
        match ams_cmd {
            0 => packets.push(decode_packet(&frame)?),
            // Port administration and router state notes; nothing to do.
            1 | 0x1000..=0x1002 => continue,
            unknown => {
                log::warn!("unknown AMS/TCP service {unknown:#x} in stream");
                return Err(Error::DecodeInvalid("unknown AMS/TCP service"));
            }
        }
    }
    Ok(packets)
}

fn decode_packet(frame: &[u8]) -> Result<Packet> {
    let header = AmsHeader::read_from_bytes(&frame[..FRAME_HEADER_SIZE])
        .map_err(|_| Error::DecodeInvalid("AMS header"))?;
    let payload = &frame[FRAME_HEADER_SIZE..];
    if payload.len() != header.data_length.get() as usize {
        return Err(Error::DecodeInvalid("AMS data length inconsistent with frame length"));
    }
    let command = Command::try_from(header.command.get())?;
    let body = decode_body(command, header.error_code.get(), payload)?;
    Ok(Packet {
        source: (header.src_netid, header.src_port.get()),
        target: (header.dest_netid, header.dest_port.get()),
        command,
        state_flags: header.state_flags.get(),
        error_code: header.error_code.get(),
        invoke_id: header.invoke_id.get(),
        body,
    })
}

fn decode_body(command: Command, error_code: u32, mut payload: &[u8]) -> Result<ResponseBody> {
    let ctx = "decoding response payload";

    // A header-level error can arrive without any payload at all.
    if error_code != 0 && payload.is_empty() {
        return Ok(match command {
            Command::DevInfo => ResponseBody::DevInfo {
                result: 0, major: 0, minor: 0, version: 0, name: String::new(),
            },
            Command::Read => ResponseBody::Read { result: 0, data: vec![] },
            Command::Write => ResponseBody::Write { result: 0 },
            Command::ReadState => ResponseBody::ReadState { result: 0, ads_state: 0, dev_state: 0 },
            Command::WriteControl => ResponseBody::WriteControl { result: 0 },
            Command::AddNotification => ResponseBody::AddNotification { result: 0, handle: 0 },
            Command::DeleteNotification => ResponseBody::DeleteNotification { result: 0 },
            Command::ReadWrite => ResponseBody::ReadWrite { result: 0, data: vec![] },
            Command::Notification => return Err(Error::DecodeInvalid("empty notification")),
        });
    }

    match command {
        Command::Notification => Ok(ResponseBody::Notification(notif::Notification::parse(payload)?)),
        Command::DevInfo => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            if result != 0 {
                return Ok(ResponseBody::DevInfo {
                    result, major: 0, minor: 0, version: 0, name: String::new(),
                });
            }
            let major = payload.read_u8().ctx(ctx)?;
            let minor = payload.read_u8().ctx(ctx)?;
            let version = payload.read_u16::<LE>().ctx(ctx)?;
            // Null-terminated, technically Windows-1252, in practice ASCII.
            let name = payload.iter().take_while(|&&ch| ch > 0).map(|&ch| ch as char).collect();
            Ok(ResponseBody::DevInfo { result, major, minor, version, name })
        }
        Command::Read | Command::ReadWrite => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            let data = if result == 0 {
                let length = payload.read_u32::<LE>().ctx(ctx)? as usize;
                if payload.len() < length {
                    return Err(Error::DecodeInvalid("read data shorter than declared"));
                }
                payload[..length].to_vec()
            } else {
                vec![]
            };
            Ok(if command == Command::Read {
                ResponseBody::Read { result, data }
            } else {
                ResponseBody::ReadWrite { result, data }
            })
        }
        Command::Write => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            Ok(ResponseBody::Write { result })
        }
        Command::ReadState => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            if result != 0 {
                return Ok(ResponseBody::ReadState { result, ads_state: 0, dev_state: 0 });
            }
            let ads_state = payload.read_u16::<LE>().ctx(ctx)?;
            let dev_state = payload.read_u16::<LE>().ctx(ctx)?;
            Ok(ResponseBody::ReadState { result, ads_state, dev_state })
        }
        Command::WriteControl => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            Ok(ResponseBody::WriteControl { result })
        }
        Command::AddNotification => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            let handle = if result == 0 { payload.read_u32::<LE>().ctx(ctx)? } else { 0 };
            Ok(ResponseBody::AddNotification { result, handle })
        }
        Command::DeleteNotification => {
            let result = payload.read_u32::<LE>().ctx(ctx)?;
            Ok(ResponseBody::DeleteNotification { result })
        }
    }
}

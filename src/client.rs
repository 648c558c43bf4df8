//! The caller-visible client: connects, resolves tags, reads and writes
//! typed values, and manages change notifications across reconnects.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{Immutable, IntoBytes};

use crate::conn::{Connection, Event};
use crate::frame::{Command, ResponseBody};
use crate::notif::{self, Attributes, MonitorHandle, Registry};
use crate::options::Options;
use crate::symbol::{self, SymbolTables, UploadInfo};
use crate::tag::{self, FindTag};
use crate::value::{self, Value};
use crate::{index, Error, Result};

/// How long a `SYM_UPLOADINFO2` answer stays valid between related
/// operations.
const UPLOAD_INFO_TTL: Duration = Duration::from_secs(10);

#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct IndexLength {
    index_group: U32,
    index_offset: U32,
    length: U32,
}

#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct WriteControlReq {
    ads_state: U16,
    dev_state: U16,
    data_length: U32,
}

/// Device info returned from an ADS server.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Name of the ADS device/service.
    pub name: String,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build version.
    pub version: u16,
}

/// The ADS state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
#[repr(u16)]
pub enum AdsState {
    Invalid = 0,
    Idle = 1,
    Reset = 2,
    Init = 3,
    Start = 4,
    Run = 5,
    Stop = 6,
    SaveCfg = 7,
    LoadCfg = 8,
    PowerFail = 9,
    PowerGood = 10,
    Error = 11,
    Shutdown = 12,
    Suspend = 13,
    Resume = 14,
    Config = 15,
    Reconfig = 16,
    Stopping = 17,
    Incompatible = 18,
    Exception = 19,
}

impl TryFrom<u16> for AdsState {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0 => Self::Invalid,
            1 => Self::Idle,
            2 => Self::Reset,
            3 => Self::Init,
            4 => Self::Start,
            5 => Self::Run,
            6 => Self::Stop,
            7 => Self::SaveCfg,
            8 => Self::LoadCfg,
            9 => Self::PowerFail,
            10 => Self::PowerGood,
            11 => Self::Error,
            12 => Self::Shutdown,
            13 => Self::Suspend,
            14 => Self::Resume,
            15 => Self::Config,
            16 => Self::Reconfig,
            17 => Self::Stopping,
            18 => Self::Incompatible,
            19 => Self::Exception,
            _ => return Err(Error::DecodeInvalid("ADS state constant")),
        })
    }
}

impl std::str::FromStr for AdsState {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match &*s.to_ascii_lowercase() {
            "invalid" => Self::Invalid,
            "idle" => Self::Idle,
            "reset" => Self::Reset,
            "init" => Self::Init,
            "start" => Self::Start,
            "run" => Self::Run,
            "stop" => Self::Stop,
            "savecfg" => Self::SaveCfg,
            "loadcfg" => Self::LoadCfg,
            "powerfail" => Self::PowerFail,
            "powergood" => Self::PowerGood,
            "error" => Self::Error,
            "shutdown" => Self::Shutdown,
            "suspend" => Self::Suspend,
            "resume" => Self::Resume,
            "config" => Self::Config,
            "reconfig" => Self::Reconfig,
            "stopping" => Self::Stopping,
            "incompatible" => Self::Incompatible,
            "exception" => Self::Exception,
            _ => return Err("invalid state name"),
        })
    }
}

struct ClientShared {
    conn: Connection,
    opts: Options,
    /// Decoded tables of the current session; None until loaded and after
    /// every disconnect.
    tables: RwLock<Option<Arc<SymbolTables>>>,
    upload_info: Mutex<Option<(Instant, UploadInfo)>>,
    registry: Mutex<Registry>,
    user_tx: Sender<Event>,
}

/// A connected ADS client with symbolic tag access.
///
/// All operations take `&self`; the client can be shared across threads.
/// Reconnection is transparent: cached tables are dropped, notifications
/// are re-subscribed, and callers simply see failed operations while the
/// session is down.
pub struct Client {
    shared: Arc<ClientShared>,
    events: Receiver<Event>,
    stop_tx: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect to the PLC described by `options`.
    ///
    /// Returns once the session is established and, if configured, the
    /// symbol and data-type tables are preloaded.
    pub fn connect(options: Options) -> Result<Client> {
        options.validate()?;
        let (event_tx, event_rx) = unbounded();
        let (notif_tx, notif_rx) = unbounded();
        let (user_tx, user_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);

        let conn = Connection::open(options.clone(), event_tx, notif_tx)?;
        let shared = Arc::new(ClientShared {
            conn,
            opts: options,
            tables: RwLock::new(None),
            upload_info: Mutex::new(None),
            registry: Mutex::new(Registry::default()),
            user_tx,
        });
        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || worker_loop(shared, event_rx, notif_rx, stop_rx, ready_tx))
        };
        let client =
            Client { shared, events: user_rx, stop_tx, worker: Mutex::new(Some(worker)) };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => {
                client.close();
                Err(e)
            }
            Err(_) => {
                client.close();
                Err(Error::Disconnected("waiting for session readiness"))
            }
        }
    }

    /// Whether a session is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.conn.is_connected()
    }

    /// A receiver for session lifecycle events.
    ///
    /// Each event is delivered to one receiver; keep a single consumer.
    pub fn event_channel(&self) -> Receiver<Event> {
        self.events.clone()
    }

    /// Resolve a tag path to its address and type, loading the tables if
    /// they are not cached yet.
    pub fn resolve_tag(&self, path: &str) -> Result<FindTag> {
        Ok(self.shared.resolve(path)?.0)
    }

    /// Read a tag and decode it according to its type.
    pub fn read_tag(&self, path: &str) -> Result<Value> {
        let (tag, tables) = self.shared.resolve(path)?;
        let data = self.shared.read_raw(tag.group, tag.offset, tag.size)?;
        value::decode(&tag, &tables.types, &data)
    }

    /// Encode `value` according to the tag's type and write it.
    pub fn write_tag(&self, path: &str, value: &Value) -> Result<()> {
        let (tag, tables) = self.shared.resolve(path)?;
        let payload = value::encode(&tag, &tables.types, value)?;
        if payload.len() != tag.size as usize {
            return Err(Error::SizeMismatch {
                context: "writing tag",
                expected: tag.size,
                got: payload.len(),
            });
        }
        self.shared.write_raw(tag.group, tag.offset, &payload)
    }

    /// Subscribe to changes of a tag with default attributes (on-change,
    /// 200 ms max delay, 50 ms cycle time).
    ///
    /// The callback receives the decoded value and the server-side
    /// timestamp of the change.  Monitoring survives reconnects.
    pub fn monitor_tag<F>(&self, path: &str, callback: F) -> Result<MonitorHandle>
    where
        F: Fn(Value, DateTime<Utc>) + Send + Sync + 'static,
    {
        self.monitor_tag_with(path, Attributes::default(), callback)
    }

    /// Subscribe to changes of a tag with explicit attributes.
    pub fn monitor_tag_with<F>(
        &self, path: &str, attributes: Attributes, callback: F,
    ) -> Result<MonitorHandle>
    where
        F: Fn(Value, DateTime<Utc>) + Send + Sync + 'static,
    {
        let key = path.to_uppercase();
        let callback: notif::Callback = Arc::new(callback);
        let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
        if registry.contains(&key) {
            return Ok(registry
                .append_callback(&key, callback)
                .expect("entry exists"));
        }
        if registry.len() >= notif::MAX_NOTIFICATION_HANDLES {
            return Err(Error::TooManyHandles(notif::MAX_NOTIFICATION_HANDLES));
        }
        let (tag, _) = self.shared.resolve(path)?;
        let handle = self.shared.add_notification(&tag, &attributes)?;
        Ok(registry.insert(key, path.to_owned(), handle, attributes, callback))
    }

    /// Remove one callback registration.  When the last callback for a tag
    /// is removed, the server-side notification is deleted as well.
    pub fn stop_monitor_tag(&self, monitor: &MonitorHandle) -> Result<()> {
        let orphaned = self
            .shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .remove_callback(monitor);
        if let Some(handle) = orphaned {
            self.shared.delete_notification(handle)?;
        }
        Ok(())
    }

    /// Read raw bytes at an index group/offset, without symbol resolution.
    pub fn read_raw(&self, group: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.shared.read_raw(group, offset, length)
    }

    /// Write raw bytes at an index group/offset, without symbol resolution.
    pub fn write_raw(&self, group: u32, offset: u32, data: &[u8]) -> Result<()> {
        self.shared.write_raw(group, offset, data)
    }

    /// Read the device's name and version.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let packet = self.shared.conn.request(Command::DevInfo, &[])?;
        match packet.body {
            ResponseBody::DevInfo { major, minor, version, name, .. } => {
                Ok(DeviceInfo { name, major, minor, version })
            }
            _ => Err(Error::DecodeInvalid("device info response shape")),
        }
    }

    /// Read the ADS and device state of the device.
    pub fn state(&self) -> Result<(AdsState, u16)> {
        let packet = self.shared.conn.request(Command::ReadState, &[])?;
        match packet.body {
            ResponseBody::ReadState { ads_state, dev_state, .. } => {
                Ok((AdsState::try_from(ads_state)?, dev_state))
            }
            _ => Err(Error::DecodeInvalid("read state response shape")),
        }
    }

    /// (Try to) set the ADS and device state of the device.
    pub fn write_control(&self, ads_state: AdsState, dev_state: u16) -> Result<()> {
        let req = WriteControlReq {
            ads_state: U16::new(ads_state as u16),
            dev_state: U16::new(dev_state),
            data_length: U32::new(0),
        };
        self.shared.conn.request(Command::WriteControl, req.as_bytes())?;
        Ok(())
    }

    /// Counts and byte lengths of the symbol and data-type tables.
    pub fn upload_info(&self) -> Result<UploadInfo> {
        self.shared.upload_info()
    }

    /// Delete all notifications, stop the reconnect loop, and close the
    /// socket.  Called automatically on drop.
    pub fn close(&self) {
        let handles = {
            let mut registry = self.shared.registry.lock().expect("registry lock poisoned");
            let handles = registry.handles();
            registry.clear();
            handles
        };
        for handle in handles {
            if let Err(e) = self.shared.delete_notification(handle) {
                log::debug!("deleting notification on close: {e}");
            }
        }
        self.shared.conn.close();
        let _ = self.stop_tx.try_send(());
        let worker = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientShared {
    // `SYM_UPLOADINFO2`, cached for a few seconds so a resolve directly
    // after a preload does not refetch it.
    fn upload_info(&self) -> Result<UploadInfo> {
        {
            let cached = self.upload_info.lock().expect("upload info lock poisoned");
            if let Some((at, info)) = *cached {
                if at.elapsed() < UPLOAD_INFO_TTL {
                    return Ok(info);
                }
            }
        }
        let data = self.read_raw(index::SYS_SYM_UPLOAD_INFO2, 0, 24)?;
        let info = symbol::decode_upload_info(&data)?;
        *self.upload_info.lock().expect("upload info lock poisoned") =
            Some((Instant::now(), info));
        Ok(info)
    }

    // The session's tables, fetching and decoding them on first use.
    fn tables(&self) -> Result<Arc<SymbolTables>> {
        if let Some(tables) = self.tables.read().expect("tables lock poisoned").as_ref() {
            return Ok(tables.clone());
        }
        let info = self.upload_info()?;
        let symbol_data = self.read_raw(index::SYS_SYM_UPLOAD, 0, info.symbol_length)?;
        let type_data = self.read_raw(index::SYS_SYM_DT_UPLOAD, 0, info.data_type_length)?;
        let tables = Arc::new(SymbolTables {
            symbols: symbol::decode_symbols(&symbol_data)?,
            types: symbol::decode_data_types(&type_data)?,
        });
        log::debug!(
            "loaded {} symbols, {} types",
            tables.symbols.len(),
            tables.types.len()
        );
        *self.tables.write().expect("tables lock poisoned") = Some(tables.clone());
        Ok(tables)
    }

    fn invalidate(&self) {
        *self.tables.write().expect("tables lock poisoned") = None;
        *self.upload_info.lock().expect("upload info lock poisoned") = None;
    }

    fn resolve(&self, path: &str) -> Result<(FindTag, Arc<SymbolTables>)> {
        let tables = self.tables()?;
        let tag = tag::find_tag(path, &tables)?;
        Ok((tag, tables))
    }

    fn read_raw(&self, group: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let req = IndexLength {
            index_group: U32::new(group),
            index_offset: U32::new(offset),
            length: U32::new(length),
        };
        let packet = self.conn.request(Command::Read, req.as_bytes())?;
        match packet.body {
            ResponseBody::Read { data, .. } => Ok(data),
            _ => Err(Error::DecodeInvalid("read response shape")),
        }
    }

    fn write_raw(&self, group: u32, offset: u32, data: &[u8]) -> Result<()> {
        let req = IndexLength {
            index_group: U32::new(group),
            index_offset: U32::new(offset),
            length: U32::new(data.len().try_into()?),
        };
        let mut payload = Vec::with_capacity(req.as_bytes().len() + data.len());
        payload.extend_from_slice(req.as_bytes());
        payload.extend_from_slice(data);
        self.conn.request(Command::Write, &payload)?;
        Ok(())
    }

    fn add_notification(&self, tag: &FindTag, attributes: &Attributes) -> Result<u32> {
        let payload = notif::add_payload(tag, attributes)?;
        let packet = self.conn.request(Command::AddNotification, &payload)?;
        match packet.body {
            ResponseBody::AddNotification { handle, .. } => Ok(handle),
            _ => Err(Error::DecodeInvalid("add notification response shape")),
        }
    }

    fn delete_notification(&self, handle: u32) -> Result<()> {
        self.conn.request(Command::DeleteNotification, &handle.to_le_bytes())?;
        Ok(())
    }
}

fn worker_loop(
    shared: Arc<ClientShared>, event_rx: Receiver<Event>,
    notif_rx: Receiver<notif::Notification>, stop_rx: Receiver<()>,
    ready_tx: Sender<Result<()>>,
) {
    let mut ready = Some(ready_tx);
    loop {
        crossbeam_channel::select! {
            recv(event_rx) -> event => match event {
                Ok(event) => handle_event(&shared, event, &mut ready),
                Err(_) => return,
            },
            recv(notif_rx) -> notification => match notification {
                Ok(notification) => demux(&shared, notification),
                Err(_) => return,
            },
            recv(stop_rx) -> _ => return,
        }
    }
}

fn handle_event(shared: &Arc<ClientShared>, event: Event, ready: &mut Option<Sender<Result<()>>>) {
    match &event {
        Event::Connected => {
            // A fresh session never reuses old addresses.
            shared.invalidate();
            let preload = if shared.opts.load_symbols || shared.opts.load_data_types {
                shared.tables().map(|_| ())
            } else {
                Ok(())
            };
            match ready.take() {
                // First connect: readiness is reported to `connect()`.
                Some(tx) => {
                    let _ = tx.send(preload);
                }
                // Reconnect: preload failures are only events, and the
                // registered notifications move to the new session.
                None => {
                    if let Err(e) = preload {
                        let _ = shared.user_tx.send(Event::Error(e));
                    }
                    resubscribe(shared);
                }
            }
        }
        Event::Close { .. } => shared.invalidate(),
        Event::Reconnect | Event::Error(_) => {}
    }
    let _ = shared.user_tx.send(event);
}

// Move every registered notification to the new session: best-effort
// delete of the stale handle, then a fresh AddDeviceNotification at the
// re-resolved address.
fn resubscribe(shared: &Arc<ClientShared>) {
    let snapshot = shared.registry.lock().expect("registry lock poisoned").snapshot();
    for (key, path, old_handle, attributes) in snapshot {
        if let Err(e) = shared.delete_notification(old_handle) {
            let _ = shared.user_tx.send(Event::Error(e));
        }
        let added = shared
            .resolve(&path)
            .and_then(|(tag, _)| shared.add_notification(&tag, &attributes));
        match added {
            Ok(new_handle) => {
                log::debug!("re-subscribed {path} as handle {new_handle}");
                shared.registry.lock().expect("registry lock poisoned").rebind(&key, new_handle);
            }
            Err(e) => {
                log::error!("re-subscribing {path} failed: {e}");
                let _ = shared.user_tx.send(Event::Error(e));
            }
        }
    }
}

// Deliver every sample of a notification frame to its subscribers.  A
// failing sample or panicking callback never stops the remaining ones.
fn demux(shared: &Arc<ClientShared>, notification: notif::Notification) {
    for sample in notification.samples() {
        let subscribers =
            shared.registry.lock().expect("registry lock poisoned").subscribers(sample.handle);
        let Some((path, callbacks)) = subscribers else {
            log::debug!("notification for unknown handle {}", sample.handle);
            continue;
        };
        let timestamp = value::filetime_to_utc(sample.timestamp);
        // Symbols may have moved since subscription; resolve afresh.
        let decoded = shared
            .resolve(&path)
            .and_then(|(tag, tables)| value::decode(&tag, &tables.types, sample.data));
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                let _ = shared.user_tx.send(Event::Error(e));
                continue;
            }
        };
        for callback in callbacks {
            let value = value.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(value, timestamp))).is_err() {
                let _ = shared.user_tx.send(Event::Error(Error::CallbackPanic(path.clone())));
            }
        }
    }
}

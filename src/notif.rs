//! Everything to do with ADS notifications: subscription attributes, the
//! wire format of `DeviceNotification` frames, and the per-client registry
//! that maps server handles back to monitored tags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ReadBytesExt, LE};
use chrono::{DateTime, Utc};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{Immutable, IntoBytes};

use crate::errors::ErrContext;
use crate::tag::FindTag;
use crate::value::Value;
use crate::{Error, Result};

/// A server-assigned notification handle.
pub type Handle = u32;

/// Ceiling on concurrently registered notification handles per connection.
pub const MAX_NOTIFICATION_HANDLES: usize = 550;

/// When notifications should be generated.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TransmissionMode {
    NoTrans = 0,
    ClientCycle = 1,
    Client1Req = 2,
    ServerCycle = 3,
    ServerOnChange = 4,
}

/// Attributes for creating a notification.
///
/// The monitored length is not part of the attributes; it always comes from
/// the resolved tag, which is re-resolved after every reconnect.
#[derive(Clone, Copy, Debug)]
pub struct Attributes {
    /// When notification messages should be transmitted.
    pub trans_mode: TransmissionMode,
    /// The maximum delay between change and transmission.
    pub max_delay: Duration,
    /// The cycle time for checking for changes.
    pub cycle_time: Duration,
}

impl Attributes {
    /// Return new notification attributes.
    pub fn new(trans_mode: TransmissionMode, max_delay: Duration, cycle_time: Duration) -> Self {
        Self { trans_mode, max_delay, cycle_time }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            trans_mode: TransmissionMode::ServerOnChange,
            max_delay: Duration::from_millis(200),
            cycle_time: Duration::from_millis(50),
        }
    }
}

#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct AddNotifPayload {
    index_group: U32,
    index_offset: U32,
    length: U32,
    trans_mode: U32,
    max_delay: U32,
    cycle_time: U32,
    reserved: [u8; 16],
}

/// Build the 40-byte `AddDeviceNotification` request payload for a tag.
pub(crate) fn add_payload(tag: &FindTag, attributes: &Attributes) -> Result<Vec<u8>> {
    let payload = AddNotifPayload {
        index_group: U32::new(tag.group),
        index_offset: U32::new(tag.offset),
        length: U32::new(tag.size),
        trans_mode: U32::new(attributes.trans_mode as u32),
        max_delay: U32::new(attributes.max_delay.as_millis().try_into()?),
        cycle_time: U32::new(attributes.cycle_time.as_millis().try_into()?),
        reserved: [0; 16],
    };
    Ok(payload.as_bytes().to_vec())
}

/// A `DeviceNotification` frame: a number of stamps, each carrying a
/// FILETIME and a number of `(handle, data)` samples.
#[derive(Clone)]
pub struct Notification {
    // Payload from the stamp count on; validated in `parse`.
    data: Vec<u8>,
    nstamps: u32,
}

impl Notification {
    /// Parse the command payload of a notification frame (leading `length`
    /// field included) and validate that all declared stamps and samples
    /// are present.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let ctx = "parsing notification";
        let mut ptr = payload;
        let length = ptr.read_u32::<LE>().ctx(ctx)? as usize;
        if length != ptr.len() {
            return Err(Error::DecodeInvalid("notification length inconsistent"));
        }
        let data = ptr.to_vec();
        let nstamps = ptr.read_u32::<LE>().ctx(ctx)?;
        for _ in 0..nstamps {
            let _timestamp = ptr.read_u64::<LE>().ctx(ctx)?;
            let nsamples = ptr.read_u32::<LE>().ctx(ctx)?;
            for _ in 0..nsamples {
                let _handle = ptr.read_u32::<LE>().ctx(ctx)?;
                let size = ptr.read_u32::<LE>().ctx(ctx)? as usize;
                if ptr.len() < size {
                    return Err(Error::DecodeInvalid("notification sample truncated"));
                }
                ptr = &ptr[size..];
            }
        }
        if !ptr.is_empty() {
            return Err(Error::DecodeInvalid("trailing bytes after notification samples"));
        }
        Ok(Self { data, nstamps })
    }

    /// Return an iterator over all data samples in this notification.
    pub fn samples(&self) -> SampleIter<'_> {
        SampleIter {
            data: &self.data[4..],
            cur_timestamp: 0,
            stamps_left: self.nstamps,
            samples_left: 0,
        }
    }
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.samples()).finish()
    }
}

/// A single sample in a notification frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample<'a> {
    /// The notification handle associated with the data.
    pub handle: Handle,
    /// Timestamp of generation as a Windows FILETIME.
    pub timestamp: u64,
    /// Data of the handle at the specified time.
    pub data: &'a [u8],
}

/// An iterator over all samples within a notification frame.
///
/// Bounds were validated by `Notification::parse`, so the reads here
/// cannot run out of data.
pub struct SampleIter<'a> {
    data: &'a [u8],
    cur_timestamp: u64,
    stamps_left: u32,
    samples_left: u32,
}

impl<'a> Iterator for SampleIter<'a> {
    type Item = Sample<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.samples_left > 0 {
            let handle = self.data.read_u32::<LE>().expect("validated");
            let length = self.data.read_u32::<LE>().expect("validated") as usize;
            let (data, rest) = self.data.split_at(length);
            self.data = rest;
            self.samples_left -= 1;
            Some(Sample { handle, data, timestamp: self.cur_timestamp })
        } else if self.stamps_left > 0 {
            self.cur_timestamp = self.data.read_u64::<LE>().expect("validated");
            self.samples_left = self.data.read_u32::<LE>().expect("validated");
            self.stamps_left -= 1;
            self.next()
        } else {
            None
        }
    }
}

/// A sink receiving `(value, timestamp)` pairs for a monitored tag.
pub type Callback = Arc<dyn Fn(Value, DateTime<Utc>) + Send + Sync>;

/// Identifies one callback registration; returned by `monitor_tag` and
/// consumed by `stop_monitor_tag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorHandle {
    pub(crate) key: String,
    pub(crate) callback_id: u32,
}

impl MonitorHandle {
    /// The upper-cased path of the monitored tag.
    pub fn tag(&self) -> &str {
        &self.key
    }
}

// One monitored tag: the server handle currently bound to it and the
// ordered list of subscriber callbacks.
pub(crate) struct Entry {
    pub path: String,
    pub handle: Handle,
    pub attributes: Attributes,
    pub callbacks: Vec<(u32, Callback)>,
}

/// Active subscriptions of one client, keyed by upper-cased tag path and
/// indexed by server handle for demultiplexing.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Entry>,
    by_handle: HashMap<Handle, String>,
    next_callback_id: u32,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    // Append a callback to an existing entry.
    pub fn append_callback(&mut self, key: &str, callback: Callback) -> Option<MonitorHandle> {
        let entry = self.entries.get_mut(key)?;
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        entry.callbacks.push((id, callback));
        Some(MonitorHandle { key: key.to_owned(), callback_id: id })
    }

    // Insert a fresh entry with its first callback.
    pub fn insert(
        &mut self, key: String, path: String, handle: Handle, attributes: Attributes,
        callback: Callback,
    ) -> MonitorHandle {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.by_handle.insert(handle, key.clone());
        self.entries.insert(
            key.clone(),
            Entry { path, handle, attributes, callbacks: vec![(id, callback)] },
        );
        MonitorHandle { key, callback_id: id }
    }

    // Remove one callback; returns the server handle to delete if the
    // entry became empty and was dropped.
    pub fn remove_callback(&mut self, monitor: &MonitorHandle) -> Option<Handle> {
        let entry = self.entries.get_mut(&monitor.key)?;
        entry.callbacks.retain(|(id, _)| *id != monitor.callback_id);
        if entry.callbacks.is_empty() {
            let entry = self.entries.remove(&monitor.key).expect("entry exists");
            self.by_handle.remove(&entry.handle);
            Some(entry.handle)
        } else {
            None
        }
    }

    // Resolve a server handle to `(path, callbacks)` for demultiplexing.
    pub fn subscribers(&self, handle: Handle) -> Option<(String, Vec<Callback>)> {
        let key = self.by_handle.get(&handle)?;
        let entry = self.entries.get(key)?;
        let callbacks = entry.callbacks.iter().map(|(_, cb)| cb.clone()).collect();
        Some((entry.path.clone(), callbacks))
    }

    // Re-bind an entry to the handle assigned by a new session.
    pub fn rebind(&mut self, key: &str, new_handle: Handle) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.by_handle.remove(&entry.handle);
            entry.handle = new_handle;
            self.by_handle.insert(new_handle, key.to_owned());
        }
    }

    // Iterate `(key, path, old_handle, attributes)` snapshots for
    // re-subscription after a reconnect.
    pub fn snapshot(&self) -> Vec<(String, String, Handle, Attributes)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.path.clone(), e.handle, e.attributes))
            .collect()
    }

    // Server handles of all entries, for best-effort cleanup on close.
    pub fn handles(&self) -> Vec<Handle> {
        self.entries.values().map(|e| e.handle).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_handle.clear();
    }
}

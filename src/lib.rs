//! Talk to Beckhoff PLCs over the ADS protocol, by tag name.
//!
//! # Introduction
//!
//! ADS is the native protocol of the TwinCAT automation system produced by
//! [Beckhoff GmbH](https://www.beckhoff.com/).  This crate connects to a
//! TwinCAT runtime over AMS/TCP, uploads the runtime's self-describing
//! symbol and data-type tables, and lets you read, write and monitor PLC
//! variables by their hierarchical name, receiving decoded typed values
//! instead of raw bytes.
//!
//! The [specification](https://infosys.beckhoff.de/content/1031/tc3_adscommon/html/tcadscommon_introads.htm)
//! can be found on the Beckhoff Information System pages.
//!
//! # Example
//!
//! ```rust,ignore
//! let options = tcads::Options::new("192.168.0.10", 851);
//! let client = tcads::Client::connect(options)?;
//!
//! // Typed read of a global variable.
//! let value = client.read_tag(".Main.bRunning")?;
//!
//! // Watch a tag for changes.
//! let monitor = client.monitor_tag(".Main.rTemperature", |value, stamp| {
//!     println!("{stamp}: {value:?}");
//! })?;
//! ```
//!
//! The session reconnects automatically (see [`Options::reconnect`]); on
//! reconnect all monitored tags are re-subscribed transparently.

#![deny(missing_docs)]

pub mod errors;
pub mod index;
pub mod frame;
pub mod options;
mod conn;
pub mod symbol;
pub mod tag;
pub mod value;
pub mod notif;
pub mod client;
#[cfg(test)]
mod testing;
#[cfg(test)]
mod test;

pub use client::{AdsState, Client, DeviceInfo};
pub use conn::Event;
pub use errors::{Error, Result};
pub use notif::{Attributes, MonitorHandle, TransmissionMode};
pub use options::{Options, ADS_TCP_PORT};
pub use tag::FindTag;
pub use value::Value;

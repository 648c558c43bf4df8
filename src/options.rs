//! Connection configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::{Error, Result};

/// The default TCP port of an AMS router.
pub const ADS_TCP_PORT: u16 = 48898;
/// The default source AMS port.
pub const DEFAULT_SOURCE_AMS_PORT: u16 = 800;

/// Options for a [`Client`](crate::Client) connection.
///
/// `host` and `target_ams_port` are required; everything else has the
/// defaults documented on the fields.
#[derive(Clone, Debug)]
pub struct Options {
    /// Host name or IP address of the PLC.
    pub host: String,
    /// TCP port of the AMS router (default 48898).
    pub port: u16,
    /// Six NetID bytes of the target (`A.B.C.D.E.F` in the usual dotted
    /// rendering); default is `host` with `.1.1` appended, which requires
    /// `host` to be an IPv4 address.
    pub target_netid: Option<[u8; 6]>,
    /// AMS port of the target runtime (e.g. 851 for the first PLC).
    pub target_ams_port: u16,
    /// Our own NetID bytes; default is the local IP with `.1.1` appended.
    pub source_netid: Option<[u8; 6]>,
    /// Our own AMS port (default 800).
    pub source_ams_port: u16,
    /// Reconnect automatically after a lost session (default true).
    pub reconnect: bool,
    /// Delay before each reconnection attempt (default 5 s).
    pub reconnect_interval: Duration,
    /// Per-request response deadline (default 3 s).
    pub request_timeout: Duration,
    /// TCP connect deadline (default 3 s).
    pub connect_timeout: Duration,
    /// Preload the symbol table when a session opens (default true).
    pub load_symbols: bool,
    /// Preload the data-type table when a session opens (default true).
    pub load_data_types: bool,
}

impl Options {
    /// Options for the given host and target AMS port, everything else at
    /// its default.
    pub fn new(host: impl Into<String>, target_ams_port: u16) -> Self {
        Self {
            host: host.into(),
            port: ADS_TCP_PORT,
            target_netid: None,
            target_ams_port,
            source_netid: None,
            source_ams_port: DEFAULT_SOURCE_AMS_PORT,
            reconnect: true,
            reconnect_interval: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            load_symbols: true,
            load_data_types: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::ConfigInvalid("host must not be empty"));
        }
        if self.target_ams_port == 0 {
            return Err(Error::ConfigInvalid("target AMS port must not be zero"));
        }
        if self.target_netid.is_none() && self.host.parse::<Ipv4Addr>().is_err() {
            return Err(Error::ConfigInvalid(
                "target NetID is required when host is not an IPv4 address",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::ConfigInvalid("request timeout must not be zero"));
        }
        Ok(())
    }

    // The NetID requests are routed to.
    pub(crate) fn effective_target_netid(&self) -> Result<[u8; 6]> {
        match self.target_netid {
            Some(id) => Ok(id),
            None => {
                let ip: Ipv4Addr = self
                    .host
                    .parse()
                    .map_err(|_| Error::ConfigInvalid("host is not an IPv4 address"))?;
                Ok(netid_from_ip(ip))
            }
        }
    }
}

// The conventional NetID a host without explicit configuration goes by:
// its IPv4 address with `.1.1` appended.
pub(crate) fn netid_from_ip(ip: Ipv4Addr) -> [u8; 6] {
    let [a, b, c, d] = ip.octets();
    [a, b, c, d, 1, 1]
}

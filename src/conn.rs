//! The TCP session underneath a client: owns the socket and the routing
//! prefix, multiplexes concurrent requests on invoke IDs, and supervises
//! reconnection.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use itertools::Itertools;
use socket2::SockRef;

use crate::errors::{ads_error, ErrContext};
use crate::frame::{self, Command, Packet, ResponseBody, RoutePrefix};
use crate::notif;
use crate::options::{netid_from_ip, Options};
use crate::{Error, Result};

/// Session lifecycle events.
#[derive(Debug, Clone)]
pub enum Event {
    /// A session is established; tables are preloaded if configured.
    Connected,
    /// The session ended; `had_error` is false for a deliberate close.
    Close {
        /// Whether a transport or protocol error caused the close.
        had_error: bool,
    },
    /// A reconnection attempt is scheduled.
    Reconnect,
    /// A non-fatal transport or protocol error.
    Error(Error),
}

type PendingMap = Mutex<BTreeMap<u32, oneshot::Sender<Result<Packet>>>>;

struct Shared {
    opts: Options,
    /// Write side of the socket; the reader holds its own clone.
    socket: Mutex<Option<TcpStream>>,
    /// Routing prefix, rebuilt on every dial.
    route: Mutex<Option<RoutePrefix>>,
    /// Next invoke ID; wraps around to 1, never 0.
    invoke_id: AtomicU32,
    /// Waiters for outstanding requests, keyed by invoke ID.
    pending: PendingMap,
    connected: AtomicBool,
    closing: AtomicBool,
    event_tx: Sender<Event>,
    notif_tx: Sender<notif::Notification>,
    /// Signalled by `close()` to cut a pending reconnect delay short.
    shutdown_rx: Receiver<()>,
}

/// One ADS session with automatic reconnection.
///
/// Requests can be issued concurrently from any thread; the pending map is
/// the sole correlation point and the socket write side is serialized.
pub(crate) struct Connection {
    shared: Arc<Shared>,
    shutdown_tx: Sender<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dial the target and start the reader/reconnect supervisor.
    ///
    /// Emits `Connected` into the event channel once per established
    /// session, the first time before this function returns.
    pub fn open(
        opts: Options, event_tx: Sender<Event>, notif_tx: Sender<notif::Notification>,
    ) -> Result<Self> {
        opts.validate()?;
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let shared = Arc::new(Shared {
            opts,
            socket: Mutex::new(None),
            route: Mutex::new(None),
            invoke_id: AtomicU32::new(1),
            pending: Mutex::default(),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            event_tx,
            notif_tx,
            shutdown_rx,
        });
        let stream = dial(&shared)?;
        let supervisor = {
            let shared = shared.clone();
            std::thread::spawn(move || supervise(shared, stream))
        };
        Ok(Self { shared, shutdown_tx, supervisor: Mutex::new(Some(supervisor)) })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Execute one ADS command and await its response.
    ///
    /// Fails with `RequestTimeout` after the configured deadline, with
    /// `Disconnected` if the session ends while waiting, and with `Ads`
    /// if the server reports a nonzero error code.
    pub fn request(&self, cmd: Command, payload: &[u8]) -> Result<Packet> {
        let shared = &self.shared;
        if !shared.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let route = shared
            .route
            .lock()
            .expect("route lock poisoned")
            .ok_or(Error::NotConnected)?;
        let invoke_id = next_invoke_id(&shared.invoke_id);
        let buf = frame::encode_request(&route, cmd, invoke_id, payload)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = shared.pending.lock().expect("pending map lock poisoned");
            if pending.contains_key(&invoke_id) {
                return Err(Error::DuplicateInvokeId(invoke_id));
            }
            pending.insert(invoke_id, tx);
        }

        let written = {
            let mut guard = shared.socket.lock().expect("socket lock poisoned");
            match guard.as_mut() {
                Some(stream) => stream.write_all(&buf).ctx("sending request"),
                None => Err(Error::NotConnected),
            }
        };
        if let Err(e) = written {
            shared.pending.lock().expect("pending map lock poisoned").remove(&invoke_id);
            return Err(e);
        }

        let packet = match rx.recv_timeout(shared.opts.request_timeout) {
            Ok(result) => result?,
            Err(oneshot::RecvTimeoutError::Timeout) => {
                shared.pending.lock().expect("pending map lock poisoned").remove(&invoke_id);
                return Err(Error::RequestTimeout(cmd.action(), shared.opts.request_timeout));
            }
            Err(oneshot::RecvTimeoutError::Disconnected) => {
                shared.pending.lock().expect("pending map lock poisoned").remove(&invoke_id);
                return Err(Error::Disconnected(cmd.action()));
            }
        };

        if packet.command != cmd {
            return Err(Error::DecodeInvalid("response answers a different command"));
        }
        if packet.state_flags != frame::STATE_FLAGS_RESPONSE {
            return Err(Error::DecodeInvalid("unexpected state flags in response"));
        }
        if packet.error_code != 0 {
            return ads_error(cmd.action(), packet.error_code);
        }
        let result = packet.body.result();
        if result != 0 {
            return ads_error(cmd.action(), result);
        }
        Ok(packet)
    }

    /// Stop the session and the reconnect loop.  Idempotent.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.try_send(());
        if let Ok(guard) = self.shared.socket.lock() {
            if let Some(stream) = guard.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        let handle = self.supervisor.lock().expect("supervisor lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn next_invoke_id(counter: &AtomicU32) -> u32 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

// Establish a TCP session: connect, configure the socket, build the
// routing prefix, and publish the write side.  Emits `Connected`.
fn dial(shared: &Shared) -> Result<TcpStream> {
    let opts = &shared.opts;
    let addr = (opts.host.as_str(), opts.port)
        .to_socket_addrs()
        .ctx("resolving target address")?
        .next()
        .ok_or(Error::ConfigInvalid("no address could be resolved for host"))?;
    let stream = TcpStream::connect_timeout(&addr, opts.connect_timeout)
        .ctx("establishing connection to remote AMS router")?;
    stream.set_nodelay(true).ctx("setting TCP_NODELAY")?;
    SockRef::from(&stream).set_keepalive(true).ctx("setting TCP keepalive")?;

    let source_netid = match opts.source_netid {
        Some(id) => id,
        None => match stream.local_addr().ctx("getting local socket address")?.ip() {
            IpAddr::V4(ip) => netid_from_ip(ip),
            IpAddr::V6(_) => [127, 0, 0, 1, 1, 1],
        },
    };
    let target_netid = opts.effective_target_netid()?;
    log::debug!(
        "session established, routing to {}:{} from {}:{}",
        target_netid.iter().format("."),
        opts.target_ams_port,
        source_netid.iter().format("."),
        opts.source_ams_port,
    );

    let reader = stream.try_clone().ctx("cloning socket for reader")?;
    *shared.route.lock().expect("route lock poisoned") = Some(RoutePrefix::new(
        (target_netid, opts.target_ams_port),
        (source_netid, opts.source_ams_port),
    ));
    *shared.socket.lock().expect("socket lock poisoned") = Some(stream);
    shared.connected.store(true, Ordering::SeqCst);
    let _ = shared.event_tx.send(Event::Connected);
    Ok(reader)
}

// Run reader sessions and the reconnect loop until closed.  The loop only
// ever ends through `close()` or with reconnection disabled.
fn supervise(shared: Arc<Shared>, first: TcpStream) {
    let mut stream = Some(first);
    loop {
        if let Some(session) = stream.take() {
            let result = reader_loop(&shared, session);
            let closing = shared.closing.load(Ordering::SeqCst);
            shared.connected.store(false, Ordering::SeqCst);
            *shared.socket.lock().expect("socket lock poisoned") = None;
            fail_pending(&shared);
            let had_error = match result {
                Ok(()) => false,
                Err(e) => {
                    if !closing {
                        log::warn!("session ended: {e}");
                        let _ = shared.event_tx.send(Event::Error(e));
                    }
                    !closing
                }
            };
            let _ = shared.event_tx.send(Event::Close { had_error });
        }

        if shared.closing.load(Ordering::SeqCst) || !shared.opts.reconnect {
            return;
        }
        let _ = shared.event_tx.send(Event::Reconnect);
        match shared.shutdown_rx.recv_timeout(shared.opts.reconnect_interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            // close() signalled or the connection handle is gone.
            _ => return,
        }
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }
        match dial(&shared) {
            Ok(session) => stream = Some(session),
            Err(e) => {
                log::warn!("reconnect attempt failed: {e}");
                let _ = shared.event_tx.send(Event::Error(e));
            }
        }
    }
}

fn reader_loop(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).ctx("receiving from server")?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        for packet in frame::drain(&mut buf)? {
            dispatch(shared, packet);
        }
    }
}

fn dispatch(shared: &Shared, packet: Packet) {
    // Ignore traffic for other endpoints behind the same router.
    if let Some(route) = *shared.route.lock().expect("route lock poisoned") {
        if packet.target != (route.src_netid, route.src_port.get()) {
            log::debug!(
                "discarding packet addressed to {}:{}",
                packet.target.0.iter().format("."),
                packet.target.1,
            );
            return;
        }
    }

    if packet.command == Command::Notification {
        if packet.error_code != 0 || packet.state_flags != frame::STATE_FLAGS_REQUEST {
            log::warn!("discarding malformed notification frame");
            return;
        }
        if let ResponseBody::Notification(notification) = packet.body {
            let _ = shared.notif_tx.send(notification);
        }
        return;
    }

    let waiter =
        shared.pending.lock().expect("pending map lock poisoned").remove(&packet.invoke_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(Ok(packet));
        }
        None => {
            // Either the request timed out already, or the server made
            // up an invoke ID.
            log::debug!("no waiter for invoke ID {}", packet.invoke_id);
        }
    }
}

fn fail_pending(shared: &Shared) {
    let waiters: Vec<_> = {
        let mut pending = shared.pending.lock().expect("pending map lock poisoned");
        let keys: Vec<u32> = pending.keys().copied().collect();
        keys.into_iter().filter_map(|k| pending.remove(&k)).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(Error::Disconnected("awaiting response")));
    }
}

//! Server façade: the single entry point that wires transport, bundler
//! construction, ID allocation, peer/reply registries, and the handshake
//! sequence together (spec §4.7/§4.8).
//!
//! Grounded in `AudioHandle` (`imbolc-core::audio::handle`): a struct owning
//! every long-lived resource the rest of the crate needs, exposing a small
//! synchronous method surface, with background threads (here: the
//! transport's receive loop and the sync-correlation dispatcher) doing the
//! actual waiting. The `/notify`-`/done` and `/status`-`/status.reply`
//! handshake pair and the `/sync`-`/synced` correlation protocol are
//! standard SuperCollider server conventions; `sync()`'s concurrent-waiter
//! design is new here (spec §8 S4) since no teacher file needs to correlate
//! replies by an embedded integer rather than by address alone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bundler::{BundleSink, Bundler};
use crate::config::Config;
use crate::error::{OscError, Result};
use crate::idalloc::IdAllocator;
use crate::osc::{OscArg, OscMessage, OscPacket};
use crate::peers::{self, PeerRegistry};
use crate::replyqueue::ReplyQueue;
use crate::timedqueue::TimedQueue;
use crate::transport::Transport;

/// Reasonable SuperCollider-style ID ranges. Not prescribed by the wire
/// protocol; chosen to match common server defaults and documented as an
/// open-question resolution rather than a spec requirement.
pub const DEFAULT_NODE_RANGE: (i32, i32) = (1000, i32::MAX / 2);
pub const DEFAULT_BUFFER_RANGE: (i32, i32) = (0, 1023);
pub const DEFAULT_AUDIO_BUS_RANGE: (i32, i32) = (0, 127);
pub const DEFAULT_CONTROL_BUS_RANGE: (i32, i32) = (0, 4095);

/// Width of one client's node-id sub-range (spec §4.4): the node space
/// above `DEFAULT_NODE_RANGE.0` divided evenly across `max_logins` clients.
fn node_slot_size(max_logins: i32) -> i32 {
    ((DEFAULT_NODE_RANGE.1 - DEFAULT_NODE_RANGE.0) / max_logins.max(1)).max(1)
}

type InitHook = Box<dyn Fn(&Server) + Send + Sync>;

struct SyncWaiter {
    done: Mutex<bool>,
    cv: Condvar,
}

/// Adapts `Transport::send`'s named-peer signature to the peer-or-default
/// shape `BundleSink` expects.
struct SinkHandle(Arc<Transport>);

impl BundleSink for SinkHandle {
    fn send_packet(&self, peer: Option<&str>, packet: &OscPacket) -> Result<()> {
        self.0.send_packet(peer, packet)
    }
}

/// The host-side control surface for one audio engine connection.
pub struct Server {
    config: Config,
    transport: Arc<Transport>,
    peers: Arc<PeerRegistry>,
    pub nodes: IdAllocator,
    pub buffers: IdAllocator,
    pub audio_buses: IdAllocator,
    pub control_buses: IdAllocator,
    reply_routes: Mutex<HashMap<&'static str, &'static str>>,
    reply_queues: Mutex<HashMap<&'static str, Arc<ReplyQueue>>>,
    done_queue: Arc<ReplyQueue>,
    status_queue: Arc<ReplyQueue>,
    sync_queue: Arc<ReplyQueue>,
    sync_next_id: AtomicI32,
    sync_waiters: Arc<Mutex<HashMap<i32, Arc<SyncWaiter>>>>,
    sync_dispatcher: Option<JoinHandle<()>>,
    init_hooks: Mutex<Vec<InitHook>>,
    client_id: AtomicI32,
    max_logins: AtomicI32,
    timed_queue: OnceLock<TimedQueue>,
}

impl Server {
    pub fn connect(config: Config) -> Result<Self> {
        let peers = Arc::new(PeerRegistry::new());
        let receive_addr: SocketAddr = format!("0.0.0.0:{}", config.receive_port)
            .parse()
            .map_err(|e| OscError::ProtocolMismatch(format!("invalid receive address: {e}")))?;
        let transport = Arc::new(Transport::bind(receive_addr, peers.clone(), config.mtu_bytes)?);

        peers.register(peers::ENGINE, config.engine_addr()?);
        peers.register(peers::INTERPRETER, config.interpreter_addr()?);

        let done_queue = Arc::new(ReplyQueue::new(32));
        let status_queue = Arc::new(ReplyQueue::new(32));
        let sync_queue = Arc::new(ReplyQueue::new(256));
        transport.register_queue("/done", done_queue.clone());
        transport.register_queue("/status.reply", status_queue.clone());
        transport.register_queue("/synced", sync_queue.clone());

        let sync_waiters = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher_queue = sync_queue.clone();
        let dispatcher_waiters = sync_waiters.clone();
        let sync_dispatcher = thread::spawn(move || {
            Self::run_sync_dispatcher(dispatcher_queue, dispatcher_waiters)
        });

        let mut reply_routes = HashMap::new();
        reply_routes.insert("/notify", "/done");
        reply_routes.insert("/b_alloc", "/done");
        reply_routes.insert("/b_allocRead", "/done");
        reply_routes.insert("/b_allocReadChannel", "/done");
        reply_routes.insert("/b_read", "/done");
        reply_routes.insert("/b_write", "/done");
        reply_routes.insert("/b_close", "/done");
        reply_routes.insert("/d_recv", "/done");
        reply_routes.insert("/d_load", "/done");
        reply_routes.insert("/status", "/status.reply");
        reply_routes.insert("/version", "/version.reply");
        reply_routes.insert("/g_queryTree", "/g_queryTree.reply");
        reply_routes.insert("/sync", "/synced");

        let client_id = config.client_id;
        let max_logins = config.max_logins.max(1);

        Ok(Server {
            config: config.clone(),
            transport,
            peers,
            nodes: IdAllocator::new(
                DEFAULT_NODE_RANGE.0 + client_id * node_slot_size(max_logins),
                DEFAULT_NODE_RANGE.0 + (client_id + 1) * node_slot_size(max_logins) - 1,
            ),
            buffers: IdAllocator::new(DEFAULT_BUFFER_RANGE.0, DEFAULT_BUFFER_RANGE.1),
            audio_buses: IdAllocator::new(DEFAULT_AUDIO_BUS_RANGE.0, DEFAULT_AUDIO_BUS_RANGE.1),
            control_buses: IdAllocator::new(DEFAULT_CONTROL_BUS_RANGE.0, DEFAULT_CONTROL_BUS_RANGE.1),
            reply_routes: Mutex::new(reply_routes),
            reply_queues: Mutex::new(HashMap::new()),
            done_queue,
            status_queue,
            sync_queue,
            sync_next_id: AtomicI32::new(0),
            sync_waiters,
            sync_dispatcher: Some(sync_dispatcher),
            init_hooks: Mutex::new(Vec::new()),
            client_id: AtomicI32::new(client_id),
            max_logins: AtomicI32::new(max_logins),
            timed_queue: OnceLock::new(),
        })
    }

    /// Perform the full mandatory handshake (spec §6): `/notify` (assigns
    /// `client_id`/`max_logins`), `/status`, then `/g_new` for this client's
    /// default group, registered as an init hook so `free_all` can re-run it.
    pub fn full_connect(config: Config, timeout: Duration) -> Result<Self> {
        let server = Self::connect(config)?;
        server.add_init_hook(Box::new(|s: &Server| {
            let gid = s.default_group_id();
            if let Err(e) = s.transport.send(
                peers::ENGINE,
                &OscPacket::Message(OscMessage::new(
                    "/g_new",
                    vec![OscArg::from(gid), OscArg::from(0_i32), OscArg::from(0_i32)],
                )),
            ) {
                log::warn!(target: "osc::server", "default group creation failed: {e}");
            }
        }));
        server.notify(true, timeout)?;
        server.status(timeout)?;
        Ok(server)
    }

    /// The reply address a command address is expected to answer on, if any.
    pub fn reply_address_for(&self, cmd_addr: &str) -> Option<&'static str> {
        self.reply_routes.lock().unwrap().get(cmd_addr).copied()
    }

    /// Register an additional command-address -> reply-address pair beyond
    /// the standard ones pre-populated at construction (spec §4.7).
    pub fn register_reply_route(&self, cmd_addr: &'static str, reply_addr: &'static str) {
        self.reply_routes.lock().unwrap().insert(cmd_addr, reply_addr);
    }

    /// Client id as known right now: the config-supplied value until
    /// `notify()`'s `/done` reply confirms (or corrects) it.
    pub fn client_id(&self) -> i32 {
        self.client_id.load(Ordering::Relaxed)
    }

    pub fn max_logins(&self) -> i32 {
        self.max_logins.load(Ordering::Relaxed)
    }

    /// Node ID reserved as this client's default group: `client_id + 1` by
    /// convention (spec §4.7).
    pub fn default_group_id(&self) -> i32 {
        self.client_id() + 1
    }

    pub fn add_init_hook(&self, hook: InitHook) {
        self.init_hooks.lock().unwrap().push(hook);
    }

    fn run_init_hooks(&self) {
        let hooks = self.init_hooks.lock().unwrap();
        for hook in hooks.iter() {
            hook(self);
        }
    }

    /// `/notify` handshake: tell the engine to start sending us
    /// notifications, and block for its `/done` reply, which (spec §6)
    /// carries the server-assigned `client_id` and `max_logins`. Those
    /// values, not the config-supplied defaults, become authoritative for
    /// `client_id()`/`max_logins()`/`default_group_id()` once parsed.
    pub fn notify(&self, on: bool, timeout: Duration) -> Result<OscMessage> {
        let msg = OscMessage::new(
            "/notify",
            vec![OscArg::from(on as i32), OscArg::from(self.client_id())],
        );
        self.transport.send(peers::ENGINE, &OscPacket::Message(msg))?;
        let reply = self.done_queue.get(timeout, true)?;
        if let (Some(OscArg::Int32(cid)), Some(OscArg::Int32(logins))) =
            (reply.args.get(1), reply.args.get(2))
        {
            self.client_id.store(*cid, Ordering::Relaxed);
            self.max_logins.store((*logins).max(1), Ordering::Relaxed);
        }
        self.run_init_hooks();
        Ok(reply)
    }

    /// `/status` handshake: block for the `/status.reply` counterpart.
    pub fn status(&self, timeout: Duration) -> Result<OscMessage> {
        let msg = OscMessage::new("/status", vec![]);
        self.transport.send(peers::ENGINE, &OscPacket::Message(msg))?;
        self.status_queue.get(timeout, true)
    }

    /// Send a single OSC message, or append it to the thread-current
    /// bundler, per spec §4.7's `msg(address, args, bundle=?)`: `bundle ==
    /// Some(false)` (or no active bundler) sends immediately; `bundle ==
    /// Some(true)` or `None` with an active capture scope appends to it at
    /// the bundler's current `passed_time`.
    pub fn msg(
        &self,
        address: impl Into<String>,
        args: Vec<OscArg>,
        bundle: Option<bool>,
    ) -> Result<()> {
        let message = OscMessage::new(address, args);
        let current = crate::bundler::current_bundler();
        let want_bundled = bundle.unwrap_or_else(|| current.is_some());
        match (want_bundled, current) {
            (true, Some(current)) => {
                let offset = current.passed_time();
                current.add(offset, message).map(|_| ())
            }
            _ => self
                .transport
                .send(peers::ENGINE, &OscPacket::Message(message)),
        }
    }

    /// A fresh bundler bound to this server's transport and latency, ready
    /// for `enter()` or explicit `send()`.
    pub fn bundler(&self, timetag: Option<f64>) -> Bundler {
        let sink: Arc<dyn BundleSink> = Arc::new(SinkHandle(self.transport.clone()));
        Bundler::new(timetag)
            .with_latency(self.config.latency_seconds)
            .with_sink(sink, Some(peers::ENGINE))
    }

    /// Spec §4.3's transport-level convenience: send one message and, if the
    /// address has a registered reply-address, block on that reply queue for
    /// `timeout` and return the payload. `/sync` is excluded — it correlates
    /// replies by an embedded id rather than by address alone, so callers
    /// must use [`Server::sync`] instead.
    pub fn send_and_await(
        &self,
        address: impl Into<String>,
        args: Vec<OscArg>,
        timeout: Duration,
    ) -> Result<Option<OscMessage>> {
        let address = address.into();
        if address == "/sync" {
            return Err(OscError::ProtocolMismatch(
                "/sync replies correlate by id; call Server::sync instead".to_string(),
            ));
        }
        let reply_addr = self.reply_address_for(&address);
        let queue = reply_addr.map(|r| self.ensure_reply_queue(r));
        self.transport
            .send(peers::ENGINE, &OscPacket::Message(OscMessage::new(address, args)))?;
        match queue {
            Some(q) => q.get(timeout, true).map(Some),
            None => Ok(None),
        }
    }

    fn ensure_reply_queue(&self, reply_addr: &'static str) -> Arc<ReplyQueue> {
        if reply_addr == "/done" {
            return self.done_queue.clone();
        }
        if reply_addr == "/status.reply" {
            return self.status_queue.clone();
        }
        let mut queues = self.reply_queues.lock().unwrap();
        if let Some(q) = queues.get(reply_addr) {
            return q.clone();
        }
        let q = Arc::new(ReplyQueue::new(32));
        self.transport.register_queue(reply_addr, q.clone());
        queues.insert(reply_addr, q.clone());
        q
    }

    /// Reset the engine's node tree and re-run the init hooks (spec §4.7),
    /// so consumers that registered a default-group hook get it re-created.
    pub fn free_all(&self) -> Result<()> {
        self.transport.send(
            peers::ENGINE,
            &OscPacket::Message(OscMessage::new("/g_freeAll", vec![OscArg::from(0_i32)])),
        )?;
        self.run_init_hooks();
        Ok(())
    }

    /// The server's lazily-started timed dispatch queue (spec §4.6):
    /// started on first use so a façade that never defers anything doesn't
    /// pay for an idle worker thread.
    pub fn timed_queue(&self) -> &TimedQueue {
        self.timed_queue.get_or_init(TimedQueue::new)
    }

    /// `put_bundler(deadline, bundler)`: dispatch `bundler` at `delay` from
    /// now, using the bundler's own (possibly absolute) base for the
    /// engine-side timetag (spec §4.6).
    pub fn put_bundler(&self, delay: Duration, bundler: Bundler, peer: Option<&str>) -> Result<()> {
        self.timed_queue().put_bundle(delay, bundler, peer)
    }

    /// `put_msg` shortcut: build a one-message bundle and defer it the same
    /// way `put_bundler` would.
    pub fn put_msg(
        &self,
        delay: Duration,
        address: impl Into<String>,
        args: Vec<OscArg>,
        peer: Option<&str>,
    ) -> Result<()> {
        let bundler = self.bundler(Some(0.0)).with_send_on_exit(false);
        bundler.add(0.0, OscMessage::new(address, args))?;
        self.put_bundler(delay, bundler, peer.or(Some(peers::ENGINE)))
    }

    /// Defer an arbitrary callback (optionally on a fresh thread) to run at
    /// `delay` from now, via the server's timed queue.
    pub fn put_callback<F>(&self, delay: Duration, spawn: bool, run: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.timed_queue().put_callback(delay, spawn, run)
    }

    /// Block until the engine has processed everything sent before this
    /// call. Spec §8 S4: concurrent `sync()` callers each wait only for
    /// their own correlation id, regardless of reply interleaving.
    pub fn sync(&self, timeout: Duration) -> Result<()> {
        let id = self.sync_next_id.fetch_add(1, Ordering::Relaxed);
        let waiter = Arc::new(SyncWaiter {
            done: Mutex::new(false),
            cv: Condvar::new(),
        });
        self.sync_waiters.lock().unwrap().insert(id, waiter.clone());

        let msg = OscMessage::new("/sync", vec![OscArg::from(id)]);
        if let Err(e) = self.transport.send(peers::ENGINE, &OscPacket::Message(msg)) {
            self.sync_waiters.lock().unwrap().remove(&id);
            return Err(e);
        }

        let result = {
            let guard = waiter.done.lock().unwrap();
            let (guard, timeout_result) = self.cv_wait(&waiter.cv, guard, timeout);
            if *guard {
                Ok(())
            } else if timeout_result {
                Err(OscError::TimedOut)
            } else {
                Err(OscError::Shutdown)
            }
        };
        self.sync_waiters.lock().unwrap().remove(&id);
        result
    }

    fn cv_wait<'a>(
        &self,
        cv: &Condvar,
        mut guard: std::sync::MutexGuard<'a, bool>,
        timeout: Duration,
    ) -> (std::sync::MutexGuard<'a, bool>, bool) {
        let deadline = std::time::Instant::now() + timeout;
        while !*guard {
            let now = std::time::Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (g, result) = cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if result.timed_out() && !*guard {
                return (guard, true);
            }
        }
        (guard, false)
    }

    fn run_sync_dispatcher(
        queue: Arc<ReplyQueue>,
        waiters: Arc<Mutex<HashMap<i32, Arc<SyncWaiter>>>>,
    ) {
        loop {
            match queue.get(Duration::from_millis(200), false) {
                Ok(msg) => {
                    let id = match msg.args.first() {
                        Some(OscArg::Int32(v)) => *v,
                        _ => continue,
                    };
                    if let Some(waiter) = waiters.lock().unwrap().get(&id).cloned() {
                        *waiter.done.lock().unwrap() = true;
                        waiter.cv.notify_all();
                    }
                }
                Err(OscError::TimedOut) => continue,
                Err(OscError::Shutdown) => return,
                Err(_) => continue,
            }
        }
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.done_queue.close();
        self.status_queue.close();
        self.sync_queue.close();
        if let Some(handle) = self.sync_dispatcher.take() {
            let _ = handle.join();
        }
    }
}

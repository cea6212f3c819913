//! Minimal mock audio engine for integration tests: a bare UDP socket that
//! answers handshake and sync requests the way a real engine would, without
//! pulling in any of this crate's own `Transport`.
//!
//! Grounded in `imbolc-net/tests/common/mod.rs`'s `RawClient` pattern in the
//! teacher workspace: a small standalone socket wrapper driven from the
//! test thread plus a background responder thread, kept deliberately
//! separate from the crate under test so these tests exercise the real wire
//! format rather than round-tripping through the crate's own encoder on
//! both ends.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use scosc_core::{OscArg, OscMessage, OscPacket};

pub struct MockEngine {
    pub addr: std::net::SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Every message the mock engine has received, for assertions on
    /// fire-and-forget commands (e.g. `/g_new`, `/g_freeAll`) that have no
    /// reply of their own.
    pub received: Arc<Mutex<Vec<OscMessage>>>,
}

impl MockEngine {
    /// Bind a mock engine that replies to `/notify`, `/status`, and `/sync`
    /// with the standard handshake counterparts, and pushes every other
    /// received message onto `reflect` (if given) for assertions.
    pub fn start() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let addr = socket.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let received = Arc::new(Mutex::new(Vec::new()));
        let worker_received = received.clone();
        let handle = thread::spawn(move || Self::run(socket, worker_running, worker_received));
        MockEngine {
            addr,
            running,
            handle: Some(handle),
            received,
        }
    }

    fn run(socket: UdpSocket, running: Arc<AtomicBool>, received: Arc<Mutex<Vec<OscMessage>>>) {
        let mut buf = vec![0u8; 65_536];
        while running.load(Ordering::Relaxed) {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let packet = match OscPacket::decode(&buf[..len]) {
                Ok(p) => p,
                Err(_) => continue,
            };
            for msg in flatten(packet) {
                received.lock().unwrap().push(msg.clone());
                if let Some(reply) = Self::canned_reply(&msg) {
                    let bytes = OscPacket::Message(reply).encode().unwrap();
                    let _ = socket.send_to(&bytes, from);
                }
            }
        }
    }

    fn canned_reply(msg: &OscMessage) -> Option<OscMessage> {
        match msg.addr.as_str() {
            "/notify" => Some(OscMessage::new(
                "/done",
                vec![
                    OscArg::from("/notify"),
                    OscArg::from(2_i32),
                    OscArg::from(4_i32),
                ],
            )),
            "/status" => Some(OscMessage::new(
                "/status.reply",
                vec![
                    OscArg::from(1_i32),
                    OscArg::from(0_i32),
                    OscArg::from(0_i32),
                    OscArg::from(0_i32),
                    OscArg::from(2_i32),
                    OscArg::from(0.0_f32),
                    OscArg::from(0.0_f32),
                    OscArg::from(44100.0_f64),
                    OscArg::from(44100.0_f64),
                ],
            )),
            "/sync" => {
                let id = msg.args.first().cloned();
                id.map(|id| OscMessage::new("/synced", vec![id]))
            }
            "/ping" => {
                let id = msg.args.first().cloned();
                id.map(|id| OscMessage::new("/pong", vec![id]))
            }
            _ => None,
        }
    }
}

/// Flatten a message-or-bundle packet (the engine sees nested bundles too,
/// e.g. when a deferred send routes a single message through a `Bundler`).
fn flatten(packet: OscPacket) -> Vec<OscMessage> {
    fn walk(el: scosc_core::OscElement, out: &mut Vec<OscMessage>) {
        match el {
            scosc_core::OscElement::Message(m) => out.push(m),
            scosc_core::OscElement::Bundle(b) => {
                for e in b.elements {
                    walk(e, out);
                }
            }
        }
    }
    let mut out = Vec::new();
    match packet {
        OscPacket::Message(m) => out.push(m),
        OscPacket::Bundle(b) => {
            for e in b.elements {
                walk(e, &mut out);
            }
        }
    }
    out
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

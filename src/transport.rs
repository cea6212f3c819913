//! UDP transport: one bound socket, a dedicated receive thread, and
//! address-keyed dispatch into reply queues (spec §4.3).
//!
//! Grounded in `osc_client.rs`'s `OscClient` in the teacher workspace: a
//! `UdpSocket` with `set_read_timeout` polled from a dedicated thread
//! (rather than async), `rosc::decoder::decode_udp` on each datagram, and a
//! short-lived lock taken only around the actual `send_to` call so senders
//! from any thread serialize without blocking on receive. We generalize
//! `OscClient`'s single hardcoded reply-queue table into the address-keyed
//! `HashMap<String, Arc<ReplyQueue>>` spec.md's reply-queue registry calls
//! for, and add the MTU check and unmatched-address catch-all spec.md adds
//! on top of the teacher's single-peer client.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bundler::BundleSink;
use crate::error::{OscError, Result};
use crate::osc::OscPacket;
use crate::peers::PeerRegistry;
use crate::replyqueue::ReplyQueue;

/// Invoked with every decoded message whose address has no registered
/// reply queue. Receives the raw address and the peer it arrived from.
pub type UnmatchedHandler = Box<dyn Fn(&crate::osc::OscMessage, SocketAddr) + Send + Sync>;

struct Shared {
    socket: UdpSocket,
    peers: Arc<PeerRegistry>,
    queues: RwLock<HashMap<String, Arc<ReplyQueue>>>,
    unmatched: Mutex<Option<UnmatchedHandler>>,
    mtu: usize,
    send_lock: Mutex<()>,
}

/// A bound UDP socket with a background decode/dispatch thread.
pub struct Transport {
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl Transport {
    /// Bind `local_addr` and start the receive thread. `mtu` bounds outgoing
    /// datagram size (spec §4.3); `peers` is shared with the caller so the
    /// server façade can register/resolve names against the same table.
    pub fn bind(local_addr: SocketAddr, peers: Arc<PeerRegistry>, mtu: usize) -> Result<Self> {
        let socket = UdpSocket::bind(local_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let shared = Arc::new(Shared {
            socket,
            peers,
            queues: RwLock::new(HashMap::new()),
            unmatched: Mutex::new(None),
            mtu,
            send_lock: Mutex::new(()),
        });
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let recv_shared = shared.clone();
        let recv_running = running.clone();
        let receiver = thread::spawn(move || Self::receive_loop(recv_shared, recv_running));
        Ok(Transport {
            shared,
            receiver: Some(receiver),
            running,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Register a reply queue for `address`; incoming messages matching it
    /// exactly are pushed there instead of reaching the unmatched handler.
    pub fn register_queue(&self, address: impl Into<String>, queue: Arc<ReplyQueue>) {
        self.shared
            .queues
            .write()
            .unwrap()
            .insert(address.into(), queue);
    }

    pub fn unregister_queue(&self, address: &str) {
        self.shared.queues.write().unwrap().remove(address);
    }

    /// Install the catch-all for addresses with no registered queue.
    pub fn set_unmatched_handler(&self, handler: UnmatchedHandler) {
        *self.shared.unmatched.lock().unwrap() = Some(handler);
    }

    /// Encode and send `packet` to the named peer, short-circuiting with
    /// [`OscError::PacketTooLarge`] if it exceeds the configured MTU.
    pub fn send(&self, peer: &str, packet: &OscPacket) -> Result<()> {
        let addr = self
            .shared
            .peers
            .resolve(peer)
            .ok_or_else(|| OscError::ProtocolMismatch(format!("unknown peer {peer}")))?;
        self.send_to(addr, packet)
    }

    pub fn send_to(&self, addr: SocketAddr, packet: &OscPacket) -> Result<()> {
        let bytes = packet.encode()?;
        if bytes.len() > self.shared.mtu {
            return Err(OscError::PacketTooLarge {
                len: bytes.len(),
                mtu: self.shared.mtu,
            });
        }
        let _guard = self.shared.send_lock.lock().unwrap();
        self.shared.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    fn receive_loop(shared: Arc<Shared>, running: Arc<std::sync::atomic::AtomicBool>) {
        let mut buf = vec![0u8; 65_536];
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            let (len, from) = match shared.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    log::warn!(target: "osc::transport", "recv_from failed: {e}");
                    continue;
                }
            };
            match OscPacket::decode(&buf[..len]) {
                Ok(packet) => Self::dispatch(&shared, packet, from),
                Err(e) => {
                    log::warn!(target: "osc::transport", "dropping malformed datagram from {from}: {e}");
                }
            }
        }
    }

    fn dispatch(shared: &Arc<Shared>, packet: OscPacket, from: SocketAddr) {
        for msg in flatten_messages(packet) {
            let queue = shared.queues.read().unwrap().get(&msg.addr).cloned();
            match queue {
                Some(q) => q.push(msg),
                None => {
                    if let Some(handler) = shared.unmatched.lock().unwrap().as_ref() {
                        handler(&msg, from);
                    }
                }
            }
        }
    }
}

fn flatten_messages(packet: OscPacket) -> Vec<crate::osc::OscMessage> {
    let mut out = Vec::new();
    fn walk(el: crate::osc::OscElement, out: &mut Vec<crate::osc::OscMessage>) {
        match el {
            crate::osc::OscElement::Message(m) => out.push(m),
            crate::osc::OscElement::Bundle(b) => {
                for e in b.elements {
                    walk(e, out);
                }
            }
        }
    }
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

impl BundleSink for Transport {
    fn send_packet(&self, peer: Option<&str>, packet: &OscPacket) -> Result<()> {
        match peer {
            Some(name) => self.send(name, packet),
            None => Err(OscError::ProtocolMismatch(
                "no peer given to send a bundle to".to_string(),
            )),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.running
            .store(false, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::{OscArg, OscMessage};
    use std::sync::mpsc;

    fn bind_loopback(peers: Arc<PeerRegistry>) -> Transport {
        Transport::bind("127.0.0.1:0".parse().unwrap(), peers, 65_507).unwrap()
    }

    #[test]
    fn message_round_trips_between_two_transports() {
        let peers_a = Arc::new(PeerRegistry::new());
        let peers_b = Arc::new(PeerRegistry::new());
        let a = bind_loopback(peers_a.clone());
        let b = bind_loopback(peers_b.clone());
        peers_a.register("b", b.local_addr().unwrap());

        let (tx, rx) = mpsc::channel();
        b.set_unmatched_handler(Box::new(move |msg, _from| {
            tx.send(msg.clone()).unwrap();
        }));

        let msg = OscPacket::Message(OscMessage::new("/ping", vec![OscArg::from(7_i32)]));
        a.send("b", &msg).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.addr, "/ping");
        assert_eq!(got.args, vec![OscArg::Int32(7)]);
    }

    #[test]
    fn oversized_packet_is_rejected_before_sending() {
        let peers = Arc::new(PeerRegistry::new());
        let t = Transport::bind("127.0.0.1:0".parse().unwrap(), peers.clone(), 16).unwrap();
        peers.register("self", t.local_addr().unwrap());
        let msg = OscPacket::Message(OscMessage::new(
            "/very/long/address/that/will/not/fit",
            vec![OscArg::from(1_i32)],
        ));
        let err = t.send("self", &msg).unwrap_err();
        matches!(err, OscError::PacketTooLarge { .. });
    }

    #[test]
    fn registered_queue_receives_matching_address() {
        let peers_a = Arc::new(PeerRegistry::new());
        let peers_b = Arc::new(PeerRegistry::new());
        let a = bind_loopback(peers_a.clone());
        let b = bind_loopback(peers_b.clone());
        peers_a.register("b", b.local_addr().unwrap());

        let queue = Arc::new(ReplyQueue::new(4));
        b.register_queue("/status.reply", queue.clone());

        let msg = OscPacket::Message(OscMessage::new("/status.reply", vec![OscArg::from(1_i32)]));
        a.send("b", &msg).unwrap();

        let got = queue.get(Duration::from_secs(2), true).unwrap();
        assert_eq!(got.addr, "/status.reply");
    }
}

//! S2 (wire-level): a bundler built through `Server::bundler()` — the
//! production path, with its sink bound to the server's own transport —
//! round-trips over a real socket to a raw listener exactly the way a
//! hand-built `Bundler::to_raw_osc` datagram would. The unit tests in
//! `bundler.rs` cover the composition-equivalence property in-process;
//! this exercises the same bundler through the façade's actual sink wiring.

use std::net::UdpSocket;
use std::time::Duration;

use scosc_core::osc::{OscArg, OscMessage, OscPacket};
use scosc_core::server::Server;
use scosc_core::Config;

#[test]
fn server_bundler_send_reaches_a_raw_listener_as_one_bundle() {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let engine_addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.engine_host = engine_addr.ip().to_string();
    config.engine_port = engine_addr.port();
    config.interpreter_port = 0;
    config.receive_port = 0;
    let server = Server::connect(config).unwrap();

    let bundler = server.bundler(Some(0.0)).with_send_on_exit(false);
    bundler
        .add(
            0.1,
            OscMessage::new(
                "/n_set",
                vec![OscArg::from(1001_i32), OscArg::from("freq"), OscArg::from(220.0_f32)],
            ),
        )
        .unwrap();
    bundler.send(None).unwrap();

    let mut buf = vec![0u8; 65_536];
    let (len, _from) = listener.recv_from(&mut buf).unwrap();
    let packet = OscPacket::decode(&buf[..len]).unwrap();
    match packet {
        OscPacket::Bundle(b) => {
            assert_eq!(b.elements.len(), 1);
        }
        OscPacket::Message(_) => panic!("expected a bundle, got a bare message"),
    }
}

#[test]
fn server_bundler_capture_scope_sends_on_outermost_exit() {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let engine_addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.engine_host = engine_addr.ip().to_string();
    config.engine_port = engine_addr.port();
    config.interpreter_port = 0;
    config.receive_port = 0;
    let server = Server::connect(config).unwrap();

    {
        let _scope = server.bundler(Some(0.0)).enter();
        server.msg("/n_set", vec![OscArg::from(1001_i32)], None).unwrap();
        server.msg("/n_set", vec![OscArg::from(1002_i32)], None).unwrap();
    }

    let mut buf = vec![0u8; 65_536];
    let (len, _from) = listener.recv_from(&mut buf).unwrap();
    let packet = OscPacket::decode(&buf[..len]).unwrap();
    match packet {
        OscPacket::Bundle(b) => assert_eq!(b.elements.len(), 2),
        OscPacket::Message(_) => panic!("expected a bundle, got a bare message"),
    }
}

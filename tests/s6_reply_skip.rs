//! S6: a reply queue's skip-on-stale policy discards all but the newest
//! queued reply when several arrive before the consumer looks, counting the
//! discards — exercised here over two real, independently bound
//! transports rather than the in-process unit test in `replyqueue.rs`.

use std::sync::Arc;
use std::time::Duration;

use scosc_core::{OscArg, OscMessage, OscPacket, PeerRegistry, ReplyQueue, Transport};

#[test]
fn stale_status_replies_are_skipped_and_counted() {
    let peers_client = Arc::new(PeerRegistry::new());
    let peers_engine = Arc::new(PeerRegistry::new());
    let client = Transport::bind("127.0.0.1:0".parse().unwrap(), peers_client.clone(), 1472)
        .unwrap();
    let engine = Transport::bind("127.0.0.1:0".parse().unwrap(), peers_engine.clone(), 1472)
        .unwrap();
    peers_client.register("engine", engine.local_addr().unwrap());

    let queue = Arc::new(ReplyQueue::new(16));
    client.register_queue("/status.reply", queue.clone());

    for n in 0..5 {
        let msg = OscMessage::new("/status.reply", vec![OscArg::from(n)]);
        engine
            .send_to(client.local_addr().unwrap(), &OscPacket::Message(msg))
            .unwrap();
    }

    // give the receive thread a moment to drain all five datagrams before
    // the consumer asks for one
    std::thread::sleep(Duration::from_millis(100));

    let newest = queue.get(Duration::from_secs(1), true).unwrap();
    assert_eq!(newest.args, vec![OscArg::Int32(4)]);
    assert_eq!(queue.skips(), 4);
}

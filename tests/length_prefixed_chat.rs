//! S2 — length-prefixed chat: a 4-byte big-endian prefix framing a
//! single `hello` payload is decoded exactly once.

mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retia::codec::length_prefixed::{LengthPrefixedCodec, PrefixWidth};
use retia::codec::message_callback;
use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpServer};

#[test]
fn decodes_one_length_prefixed_frame() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1670).unwrap();
    let mut server = TcpServer::new(&mut event_loop, "chat".to_string(), addr, PollerKind::Epoll).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));

    {
        let calls = calls.clone();
        let received = received.clone();
        // A fresh codec instance per connection, installed the moment the
        // connection comes up — the same pattern a server would use for
        // any per-connection decoder state.
        server.set_connect_callback(move |_el, conn| {
            if !conn.connected() {
                return;
            }
            let codec = LengthPrefixedCodec::new(PrefixWidth::Four, 0, 4096);
            let calls = calls.clone();
            let received = received.clone();
            conn.set_message_callback(message_callback(codec, move |_el, _conn, payload, _ts| {
                calls.fetch_add(1, Ordering::SeqCst);
                *received.lock().unwrap() = payload;
            }));
        });
    }

    server.start(&mut event_loop);
    let handle = event_loop.handle();
    let join = std::thread::spawn(move || event_loop.run());

    let mut stream = common::connect_with_retry("127.0.0.1:1670");
    stream.write_all(&[0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']).unwrap();

    assert!(common::wait_until(
        || calls.load(Ordering::SeqCst) == 1,
        100,
        Duration::from_millis(10),
    ));
    assert_eq!(&*received.lock().unwrap(), b"hello");

    handle.quit();
    join.join().unwrap().unwrap();
}

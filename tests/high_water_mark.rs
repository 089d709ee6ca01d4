//! Invariant 11 — crossing the high-water mark on an unread connection
//! fires the mark callback exactly once.

mod common;

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpServer};

#[test]
fn high_water_mark_fires_exactly_once() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1673).unwrap();
    let mut server = TcpServer::new(&mut event_loop, "hwm".to_string(), addr, PollerKind::Epoll).unwrap();

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    const HIGH_WATER_MARK: usize = 1024;
    const PAYLOAD_LEN: usize = 16 * 1024 * 1024;

    server.set_connect_callback(move |event_loop, conn| {
        if !conn.connected() {
            return;
        }
        conn.set_high_water_mark(HIGH_WATER_MARK);
        let payload = vec![0xABu8; PAYLOAD_LEN];
        conn.send(event_loop, &payload);
    });
    {
        let hwm_hits = hwm_hits.clone();
        server.set_high_water_mark_callback(move |_el, _conn, len| {
            assert!(len > HIGH_WATER_MARK);
            hwm_hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    server.start(&mut event_loop);
    let handle = event_loop.handle();
    let join = std::thread::spawn(move || event_loop.run());

    // Connect but deliberately don't read yet, so the unread backlog
    // crosses the mark while still sitting in the connection's own
    // output buffer.
    let mut stream = common::connect_with_retry("127.0.0.1:1673");

    assert!(common::wait_until(
        || hwm_hits.load(Ordering::SeqCst) >= 1,
        500,
        Duration::from_millis(10),
    ));
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);

    let mut total = 0usize;
    let mut buf = [0u8; 65536];
    while total < PAYLOAD_LEN {
        let n = stream.read(&mut buf).expect("drain payload");
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, PAYLOAD_LEN);

    handle.quit();
    join.join().unwrap().unwrap();
}

//! S6 — a server with 100 active connections: `shutdown_all` fires
//! every connection's close callback exactly once.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpServer};

#[test]
fn shutdown_all_closes_every_connection_exactly_once() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1672).unwrap();
    let mut server = TcpServer::new(&mut event_loop, "shutdown".to_string(), addr, PollerKind::Epoll).unwrap();
    server.set_thread_num(4).unwrap();

    let connect_ups = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    {
        let connect_ups = connect_ups.clone();
        server.set_connect_callback(move |_el, conn| {
            if conn.connected() {
                connect_ups.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    {
        let closes = closes.clone();
        server.set_close_callback(move |_el, _conn| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }

    server.start(&mut event_loop);
    let handle = event_loop.handle();
    let join = std::thread::spawn(move || event_loop.run());

    const N: usize = 100;
    let mut streams = Vec::with_capacity(N);
    for _ in 0..N {
        streams.push(common::connect_with_retry("127.0.0.1:1672"));
    }

    assert!(common::wait_until(
        || connect_ups.load(Ordering::SeqCst) == N,
        500,
        Duration::from_millis(10),
    ));
    assert_eq!(server.connection_count(), N);

    server.shutdown_all();

    assert!(common::wait_until(
        || closes.load(Ordering::SeqCst) == N,
        500,
        Duration::from_millis(10),
    ));
    assert_eq!(closes.load(Ordering::SeqCst), N);
    assert_eq!(server.connection_count(), 0);

    // Give a moment for any stray double-close to show up before
    // asserting the count didn't overshoot.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(closes.load(Ordering::SeqCst), N);

    drop(streams);
    handle.quit();
    join.join().unwrap().unwrap();
}

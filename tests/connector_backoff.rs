//! S3 / invariant 8 — a client pointed at a server that isn't listening
//! yet waits out an exponential backoff rather than busy-retrying, and
//! connects once the server finally comes up. Only the first two
//! backoff steps (500 ms, 1000 ms) are exercised here; walking the full
//! sequence up to the 30 s ceiling would make this test take over a
//! minute to run.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpClient, TcpServer};

#[test]
fn client_backs_off_then_connects_once_server_appears() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1675).unwrap();

    let mut client = TcpClient::new(&mut event_loop, "backoff-client".to_string(), addr);
    let connected = Arc::new(AtomicBool::new(false));
    {
        let connected = connected.clone();
        client.set_connect_callback(move |_el, conn| {
            if conn.connected() {
                connected.store(true, Ordering::SeqCst);
            }
        });
    }

    let client_token = client.token();
    event_loop.insert_object(client_token, client);

    let handle = event_loop.handle();
    let client_token_for_connect = client_token;
    handle.queue_in_own_loop(Box::new(move |event_loop| {
        event_loop.object_mut::<TcpClient>(client_token_for_connect).unwrap().connect(event_loop);
    }));

    let join = std::thread::spawn(move || event_loop.run());

    let started = Instant::now();

    // Nothing is listening yet: the first retry is scheduled ~500ms
    // out, so the client must not connect before that.
    std::thread::sleep(Duration::from_millis(350));
    assert!(!connected.load(Ordering::SeqCst), "connected before the first backoff delay elapsed");

    // Start the server only after the first retry attempt has already
    // failed and the second (~1000ms) backoff is in flight.
    std::thread::sleep(Duration::from_millis(300));
    let mut server_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let mut server = TcpServer::new(&mut server_loop, "backoff-server".to_string(), addr, PollerKind::Epoll).unwrap();
    server.start(&mut server_loop);
    let server_handle = server_loop.handle();
    let server_join = std::thread::spawn(move || server_loop.run());

    assert!(common::wait_until(
        || connected.load(Ordering::SeqCst),
        300,
        Duration::from_millis(10),
    ));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600), "connected suspiciously early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "connected too late: {elapsed:?}");

    handle.quit();
    join.join().unwrap().unwrap();
    server_handle.quit();
    server_join.join().unwrap().unwrap();
}

//! S5 — another thread calls `connection.send("ping")` once per
//! millisecond for 1000 ms. The peer must receive exactly 1000 copies
//! of `"ping"`, in order, with no interleaving, and the write-complete
//! callback must fire at least once.

mod common;

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpConnectionHandle, TcpServer};

#[test]
fn cross_thread_send_delivers_every_message_in_order() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1671).unwrap();
    let mut server = TcpServer::new(&mut event_loop, "pinger".to_string(), addr, PollerKind::Epoll).unwrap();

    let write_completes = Arc::new(AtomicUsize::new(0));
    let conn_handle: Arc<Mutex<Option<TcpConnectionHandle>>> = Arc::new(Mutex::new(None));

    {
        let conn_handle = conn_handle.clone();
        server.set_connect_callback(move |event_loop, conn| {
            if conn.connected() {
                *conn_handle.lock().unwrap() = Some(conn.handle(event_loop.handle()));
            }
        });
    }
    {
        let write_completes = write_completes.clone();
        server.set_write_complete_callback(move |_el, _conn| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        });
    }

    server.start(&mut event_loop);
    let loop_handle = event_loop.handle();
    let join = std::thread::spawn(move || event_loop.run());

    let mut stream = common::connect_with_retry("127.0.0.1:1671");

    assert!(common::wait_until(
        || conn_handle.lock().unwrap().is_some(),
        200,
        Duration::from_millis(10),
    ));
    let conn_handle = conn_handle.lock().unwrap().clone().unwrap();

    let sender = std::thread::spawn(move || {
        for _ in 0..1000 {
            conn_handle.send(b"ping".to_vec());
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let expected = b"ping".repeat(1000);
    let mut received = Vec::with_capacity(expected.len());
    let mut buf = [0u8; 4096];
    while received.len() < expected.len() {
        let n = stream.read(&mut buf).expect("read from server");
        assert!(n > 0, "peer closed before all pings arrived");
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received, expected);
    assert!(write_completes.load(Ordering::SeqCst) >= 1);

    sender.join().unwrap();
    loop_handle.quit();
    join.join().unwrap().unwrap();
}

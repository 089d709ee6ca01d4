//! S1 — echo server, one message.

mod common;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpServer};

#[test]
fn echoes_one_message_then_closes_on_eof() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1669).unwrap();
    let mut server = TcpServer::new(&mut event_loop, "echo".to_string(), addr, PollerKind::Epoll).unwrap();

    let connect_ups = Arc::new(AtomicUsize::new(0));
    let connect_downs = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    {
        let connect_ups = connect_ups.clone();
        let connect_downs = connect_downs.clone();
        server.set_connect_callback(move |_el, conn| {
            if conn.connected() {
                connect_ups.fetch_add(1, Ordering::SeqCst);
            } else {
                connect_downs.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    {
        let messages = messages.clone();
        server.set_message_callback(move |event_loop, conn, _ts| {
            messages.fetch_add(1, Ordering::SeqCst);
            let bytes = conn.input_buffer_mut().taken_as_vec(None);
            conn.send(event_loop, &bytes);
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

    let mut stream = common::connect_with_retry("127.0.0.1:1669");

    stream.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    drop(stream);

    assert!(common::wait_until(
        || closes.load(Ordering::SeqCst) == 1,
        100,
        Duration::from_millis(10),
    ));

    assert_eq!(connect_ups.load(Ordering::SeqCst), 1);
    assert_eq!(connect_downs.load(Ordering::SeqCst), 1);
    assert_eq!(messages.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    handle.quit();
    join.join().unwrap().unwrap();
}

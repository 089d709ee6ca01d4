//! Invariant 12 — the close callback runs strictly after the last
//! message callback for a connection, never interleaved with it.

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retia::poller::PollerKind;
use retia::{Endpoint, EventLoop, TcpServer};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Event {
    Message,
    Close,
}

#[test]
fn close_callback_runs_after_every_message_callback() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    let addr = Endpoint::from_ip_port("127.0.0.1", 1674).unwrap();
    let mut server = TcpServer::new(&mut event_loop, "order".to_string(), addr, PollerKind::Epoll).unwrap();

    let order: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let order = order.clone();
        server.set_message_callback(move |_el, conn, _ts| {
            conn.input_buffer_mut().taken_as_vec(None);
            order.lock().unwrap().push(Event::Message);
        });
    }
    {
        let order = order.clone();
        server.set_close_callback(move |_el, _conn| {
            order.lock().unwrap().push(Event::Close);
        });
    }

    server.start(&mut event_loop);
    let handle = event_loop.handle();
    let join = std::thread::spawn(move || event_loop.run());

    let mut stream = common::connect_with_retry("127.0.0.1:1674");
    stream.write_all(b"one").unwrap();
    stream.write_all(b"two").unwrap();
    stream.write_all(b"three").unwrap();
    drop(stream);

    assert!(common::wait_until(
        || order.lock().unwrap().last() == Some(&Event::Close),
        200,
        Duration::from_millis(10),
    ));

    let seq = order.lock().unwrap().clone();
    assert_eq!(seq.last(), Some(&Event::Close));
    assert_eq!(seq.iter().filter(|e| **e == Event::Close).count(), 1);
    assert!(seq.iter().any(|e| *e == Event::Message));
    // Nothing after the close callback.
    let close_pos = seq.iter().position(|e| *e == Event::Close).unwrap();
    assert_eq!(close_pos, seq.len() - 1);

    handle.quit();
    join.join().unwrap().unwrap();
}

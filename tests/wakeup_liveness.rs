//! Invariant 5 — `queue_in_own_loop` from another thread wakes a loop
//! blocked in poll with a long timeout within a bounded delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use retia::poller::PollerKind;
use retia::EventLoop;

#[test]
fn queue_in_own_loop_wakes_a_blocked_loop_quickly() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    event_loop.set_poll_timeout(Duration::from_secs(30));
    let handle = event_loop.handle();

    let join = std::thread::spawn(move || event_loop.run());

    // Give the loop thread a moment to actually enter `poll`.
    std::thread::sleep(Duration::from_millis(20));

    let ran = Arc::new(AtomicBool::new(false));
    let ran_for_cb = ran.clone();
    let started = Instant::now();
    handle.queue_in_own_loop(Box::new(move |_| {
        ran_for_cb.store(true, Ordering::SeqCst);
    }));

    while !ran.load(Ordering::SeqCst) && started.elapsed() < Duration::from_secs(1) {
        std::thread::sleep(Duration::from_millis(1));
    }
    let elapsed = started.elapsed();

    assert!(ran.load(Ordering::SeqCst), "queued task never ran");
    assert!(elapsed < Duration::from_millis(500), "wake-up took {elapsed:?}, expected milliseconds");

    handle.quit();
    join.join().unwrap().unwrap();
}

//! S4 — a repeating timer that cancels itself from inside its own
//! callback on the third invocation fires exactly three times.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retia::poller::PollerKind;
use retia::{EventLoop, TimerId};

#[test]
fn repeating_timer_self_cancels_after_third_fire() {
    let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
    event_loop.set_poll_timeout(Duration::from_millis(5));

    let count = Arc::new(AtomicUsize::new(0));
    let self_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let count_for_cb = count.clone();
    let self_id_for_cb = self_id.clone();
    let id = event_loop.run_every(
        Duration::from_millis(10),
        Box::new(move |event_loop| {
            let n = count_for_cb.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                if let Some(id) = *self_id_for_cb.lock().unwrap() {
                    event_loop.cancel_timer(id);
                }
            }
        }),
    );
    *self_id.lock().unwrap() = Some(id);

    let handle = event_loop.handle();
    let join = std::thread::spawn(move || event_loop.run());

    assert!(common::wait_until(
        || count.load(Ordering::SeqCst) >= 3,
        200,
        Duration::from_millis(10),
    ));

    // Give a cancelled repeating timer a further window to (incorrectly)
    // fire again before asserting it didn't.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 3);

    handle.quit();
    join.join().unwrap().unwrap();
}

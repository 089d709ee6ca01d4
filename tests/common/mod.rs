//! Shared integration-test harness helpers.

use std::thread;

/// Polls `condition` up to `tries` times, sleeping `step` between tries.
/// Used instead of a fixed sleep so tests don't race the event loop
/// thread under load.
pub fn wait_until(mut condition: impl FnMut() -> bool, tries: u32, step: std::time::Duration) -> bool {
    for _ in 0..tries {
        if condition() {
            return true;
        }
        thread::sleep(step);
    }
    condition()
}

/// Retries a `TcpStream::connect` until the server thread has started
/// listening (the loop thread and the bind happen concurrently with the
/// test's own startup).
pub fn connect_with_retry(addr: &str) -> std::net::TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = std::net::TcpStream::connect(addr) {
            return stream;
        }
        thread::sleep(std::time::Duration::from_millis(10));
    }
    std::net::TcpStream::connect(addr).expect("server never started listening")
}

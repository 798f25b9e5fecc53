//! Shared helpers for integration tests

use railhub::core::EventLoop;
use std::time::{Duration, Instant};

/// Run a closure on the event loop thread and wait for its result
pub fn run_on_loop<T: Send + 'static>(
    event_loop: &EventLoop,
    f: impl FnOnce() -> T + Send + 'static,
) -> T {
    let (tx, rx) = std::sync::mpsc::channel();
    event_loop.call(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("event loop did not answer")
}

/// Poll until `predicate` holds or the timeout expires
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

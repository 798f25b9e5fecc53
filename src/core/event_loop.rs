//! The event loop thread
//!
//! All domain state (controller registries, decoder/input/output values,
//! interface status) is owned by a single thread. Kernel I/O threads never
//! touch domain objects directly; they post closures here instead, and the
//! loop runs them in FIFO order, so observers always see changes in the
//! order they were caused.

use std::cell::Cell;
use tokio::sync::mpsc;

enum Call {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

thread_local! {
    static ON_EVENT_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Handle to the event loop thread
///
/// Cheap to clone; every kernel and interface holds one. Posting after
/// the loop has stopped is a no-op (the closure is dropped), which keeps
/// late kernel callbacks harmless during shutdown.
#[derive(Clone)]
pub struct EventLoop {
    tx: mpsc::UnboundedSender<Call>,
}

impl EventLoop {
    /// Spawn the event loop thread
    pub fn spawn() -> (Self, EventLoopThread) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Call>();

        let join = std::thread::Builder::new()
            .name("event-loop".into())
            .spawn(move || {
                ON_EVENT_LOOP.with(|flag| flag.set(true));
                while let Some(call) = rx.blocking_recv() {
                    match call {
                        Call::Run(f) => f(),
                        Call::Stop => break,
                    }
                }
            })
            .expect("spawn event loop thread");

        (
            Self { tx: tx.clone() },
            EventLoopThread {
                tx,
                join: Some(join),
            },
        )
    }

    /// Post a closure onto the event loop thread
    ///
    /// The only safe way for an I/O thread to mutate domain state.
    pub fn call(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Call::Run(Box::new(f)));
    }

    /// True when the calling thread is the event loop thread
    pub fn is_current() -> bool {
        ON_EVENT_LOOP.with(|flag| flag.get())
    }

    /// Debug assertion that the caller runs on the event loop thread
    ///
    /// Domain mutation paths call this; it is compiled out in release.
    #[track_caller]
    pub fn assert_current() {
        debug_assert!(
            Self::is_current(),
            "domain state touched outside the event loop thread"
        );
    }

    /// Mark the calling thread as the event loop thread
    ///
    /// For unit tests that drive domain objects directly, without
    /// spawning the loop.
    #[doc(hidden)]
    pub fn mark_thread_as_event_loop() {
        ON_EVENT_LOOP.with(|flag| flag.set(true));
    }
}

/// Owns the event loop thread; `stop` drains pending calls and joins
pub struct EventLoopThread {
    tx: mpsc::UnboundedSender<Call>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Stop the loop after the calls posted so far have run
    pub fn stop(mut self) {
        let _ = self.tx.send(Call::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let _ = self.tx.send(Call::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_calls_run_in_fifo_order() {
        let (event_loop, thread) = EventLoop::spawn();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = log.clone();
            event_loop.call(move || log.lock().push(i));
        }

        thread.stop();
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_is_current_only_on_loop_thread() {
        let (event_loop, thread) = EventLoop::spawn();
        assert!(!EventLoop::is_current());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        event_loop.call(move || {
            if EventLoop::is_current() {
                seen_clone.store(1, Ordering::SeqCst);
            }
        });

        thread.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_after_stop_is_harmless() {
        let (event_loop, thread) = EventLoop::spawn();
        thread.stop();

        // The loop is gone; this must not panic or block.
        event_loop.call(|| {});
    }
}

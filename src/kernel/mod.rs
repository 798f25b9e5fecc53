//! Shared kernel scaffolding
//!
//! Every protocol kernel owns one I/O thread running a current-thread
//! tokio runtime. All kernel state lives on that thread; other threads
//! interact with it exclusively through [`KernelHandle::post`], which
//! moves a closure onto the I/O thread. Frames arriving from a hardware
//! link are fed to the kernel on the same thread, so kernel state is
//! never locked.
//!
//! Timers (startup delay, fast clock, heartbeats) are tasks on the
//! kernel's runtime posting back through the handle; they die with the
//! runtime when the kernel stops.

use crate::decoder::DecoderController;
use crate::error::{HubError, Result};
use crate::input::InputController;
use crate::interface::TransportConfig;
use crate::output::OutputController;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// World state at kernel start, for post-start reconciliation
///
/// The kernel catches the device up with this after `started`; later
/// transitions arrive as posted commands from the interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorldSnapshot {
    pub power_on: bool,
    pub run: bool,
}

/// Weak links to the domain controllers, set before `start`
///
/// Weak so a dropped interface never keeps its kernel's targets alive;
/// kernels upgrade on the event loop side of each post.
#[derive(Clone, Default)]
pub struct ControllerLinks {
    pub decoder: Option<Weak<dyn DecoderController>>,
    pub input: Option<Weak<dyn InputController>>,
    pub output: Option<Weak<dyn OutputController>>,
}

/// External layout simulator endpoint for simulation IO handlers
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub host: String,
    pub port: u16,
}

/// Which IO handler a kernel is built with
#[derive(Clone)]
pub enum IoConfig {
    /// Real hardware behind a byte link
    Hardware(TransportConfig),
    /// Loopback answering the wire protocol, optionally bridged to an
    /// external layout simulator
    Simulation { simulator: Option<SimulatorConfig> },
}

impl IoConfig {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Self::Simulation { .. })
    }
}

/// Open the byte link for a hardware transport config
///
/// Must be called from the kernel's runtime (inside `build`).
pub fn open_link(
    transport: &TransportConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<crate::transport::LinkChannels> {
    use crate::transport::{Link, SerialLink, TcpLink, UdpLink};
    match transport {
        TransportConfig::Serial {
            device,
            baud_rate,
            flow_control,
        } => SerialLink::new(device.clone(), *baud_rate, *flow_control).spawn(shutdown),
        TransportConfig::Tcp { host, port } => TcpLink::new(host.clone(), *port).spawn(shutdown),
        TransportConfig::Udp { host, port } => UdpLink::new(host.clone(), *port).spawn(shutdown),
    }
}

type Post<K> = Box<dyn FnOnce(&mut K) + Send + 'static>;

enum Cmd<K> {
    Run(Post<K>),
    Stop,
}

/// Kernel state driven by the shared runner
pub trait KernelState: Send + 'static {
    /// A chunk of raw bytes arrived from the hardware link
    fn bytes_received(&mut self, chunk: Bytes);

    /// The hardware link closed or failed after start
    fn link_closed(&mut self);

    /// The kernel is about to stop; flush best-effort state
    fn stopping(&mut self) {}
}

/// Handle for posting closures onto a kernel's I/O thread
pub struct KernelHandle<K> {
    tx: mpsc::UnboundedSender<Cmd<K>>,
}

impl<K> Clone for KernelHandle<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K: KernelState> KernelHandle<K> {
    /// Post a closure onto the kernel's I/O thread
    ///
    /// Returns `false` if the kernel has stopped.
    pub fn post(&self, f: impl FnOnce(&mut K) + Send + 'static) -> bool {
        self.tx.send(Cmd::Run(Box::new(f))).is_ok()
    }

    /// Run a closure on the I/O thread after a delay
    ///
    /// Must be called from the kernel's runtime (kernel code itself).
    /// The returned task can be aborted; it is also cancelled when the
    /// kernel stops.
    pub fn post_delayed(
        &self,
        delay: Duration,
        f: impl FnOnce(&mut K) + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Cmd::Run(Box::new(f)));
        })
    }

    /// Run a closure on the I/O thread at a fixed period
    ///
    /// First tick fires one period from now. Same cancellation rules as
    /// [`Self::post_delayed`].
    pub fn post_interval(
        &self,
        period: Duration,
        f: impl Fn(&mut K) + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        let f = Arc::new(f);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // completes immediately
            loop {
                interval.tick().await;
                let f = f.clone();
                if tx.send(Cmd::Run(Box::new(move |k: &mut K| f(k)))).is_err() {
                    break;
                }
            }
        })
    }
}

/// A running kernel: its I/O thread plus the posting handle
///
/// `stop` is idempotent; dropping an unstopped kernel stops it.
pub struct KernelThread<K> {
    handle: KernelHandle<K>,
    shutdown: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl<K: KernelState> KernelThread<K> {
    pub fn handle(&self) -> &KernelHandle<K> {
        &self.handle
    }
}

impl<K> KernelThread<K> {
    /// Stop the kernel: run the commands posted so far, stop the IO
    /// handler, cancel timers, join the thread
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.handle.tx.send(Cmd::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl<K> Drop for KernelThread<K> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a kernel I/O thread
///
/// `build` runs on the new thread inside its runtime: it opens the IO
/// handler and returns the kernel state plus, for hardware links, the
/// raw byte receiver. A build error is delivered to `on_build_error`
/// (typically posting an error to the event loop) and the thread exits
/// without running.
pub fn spawn<K, B, E>(thread_name: &str, build: B, on_build_error: E) -> KernelThread<K>
where
    K: KernelState,
    B: FnOnce(&KernelHandle<K>, Arc<AtomicBool>) -> Result<(K, Option<mpsc::Receiver<Bytes>>)>
        + Send
        + 'static,
    E: FnOnce(HubError) + Send + 'static,
{
    let (tx, mut cmd_rx) = mpsc::unbounded_channel::<Cmd<K>>();
    let handle = KernelHandle { tx };
    let shutdown = Arc::new(AtomicBool::new(false));

    let thread_handle = handle.clone();
    let thread_shutdown = shutdown.clone();
    let join = std::thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    on_build_error(HubError::Runtime { source: e });
                    return;
                }
            };

            rt.block_on(async move {
                let (mut kernel, mut io_rx) = match build(&thread_handle, thread_shutdown) {
                    Ok(built) => built,
                    Err(e) => {
                        on_build_error(e);
                        return;
                    }
                };
                drop(thread_handle);

                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(Cmd::Run(f)) => f(&mut kernel),
                            Some(Cmd::Stop) | None => break,
                        },
                        chunk = recv_opt(&mut io_rx) => match chunk {
                            Some(bytes) => kernel.bytes_received(bytes),
                            None => {
                                io_rx = None;
                                kernel.link_closed();
                            }
                        },
                    }
                }

                kernel.stopping();
            });
        })
        .expect("spawn kernel thread");

    KernelThread {
        handle,
        shutdown,
        join: Some(join),
    }
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct TestKernel {
        chunks: Arc<Mutex<Vec<Bytes>>>,
        counter: u32,
    }

    impl KernelState for TestKernel {
        fn bytes_received(&mut self, chunk: Bytes) {
            self.chunks.lock().push(chunk);
        }

        fn link_closed(&mut self) {}
    }

    fn spawn_test(
        chunks: Arc<Mutex<Vec<Bytes>>>,
        io_rx: Option<mpsc::Receiver<Bytes>>,
    ) -> KernelThread<TestKernel> {
        spawn(
            "test-kernel",
            move |_, _| Ok((TestKernel { chunks, counter: 0 }, io_rx)),
            |_| panic!("unexpected build error"),
        )
    }

    #[test]
    fn test_posted_closures_run_in_order() {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let mut thread = spawn_test(chunks.clone(), None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10u32 {
            let seen = seen.clone();
            thread.handle().post(move |k| {
                k.counter += 1;
                seen.lock().push((i, k.counter));
            });
        }
        thread.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[9], (9, 10));
    }

    #[test]
    fn test_bytes_flow_to_kernel() {
        let (io_tx, io_rx) = mpsc::channel(16);
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let mut thread = spawn_test(chunks.clone(), Some(io_rx));

        io_tx.blocking_send(Bytes::from_static(b"\x01\x02")).unwrap();

        for _ in 0..50 {
            if !chunks.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        thread.stop();
        assert_eq!(chunks.lock().as_slice(), &[Bytes::from_static(b"\x01\x02")]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let mut thread = spawn_test(chunks, None);
        thread.stop();
        thread.stop();
    }

    #[test]
    fn test_delayed_post_fires() {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let mut thread = spawn_test(chunks.clone(), None);

        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        let handle = thread.handle().clone();
        // post_delayed must run on the kernel runtime, so arm it from a
        // posted closure.
        thread.handle().post(move |_| {
            let fired = fired_clone.clone();
            handle.post_delayed(Duration::from_millis(20), move |_| {
                *fired.lock() = true;
            });
        });

        std::thread::sleep(Duration::from_millis(100));
        thread.stop();
        assert!(*fired.lock());
    }

    #[test]
    fn test_build_error_reported() {
        let reported = Arc::new(Mutex::new(None));
        let reported_clone = reported.clone();
        let mut thread: KernelThread<TestKernel> = spawn(
            "test-kernel-fail",
            |_, _| {
                Err(HubError::MakeAddress {
                    host: "nowhere".into(),
                })
            },
            move |e| *reported_clone.lock() = Some(e.to_string()),
        );
        // Give the thread a moment to run build before joining.
        std::thread::sleep(Duration::from_millis(20));
        thread.stop();
        assert!(reported.lock().as_deref().unwrap().contains("nowhere"));
    }
}

//! The background sync worker.
//!
//! One worker per file-backed cache, spawned when `sync_interval` is
//! non-zero. It sleeps on a condvar so `close` can interrupt a full interval,
//! wakes to flush the dirty cursor window of the data region plus the index
//! file, and exits when the owning cache is dropped.

use std::{sync::Arc, thread, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::cache::Inner;

#[derive(Default)]
struct Signal {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

pub(crate) struct Flusher {
    signal: Arc<Signal>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Flusher {
    pub fn spawn(inner: Arc<Inner>, interval: Duration) -> Flusher {
        let signal = Arc::new(Signal::default());
        let worker_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name("mmcache-sync".to_string())
            .spawn(move || run(&inner, &worker_signal, interval))
            .ok();

        if handle.is_none() {
            // Rare enough to not deserve an error path of its own: the cache
            // still works, it just only flushes on close.
            warn!("Failed to spawn background sync worker.");
        }

        Flusher { signal, handle }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        {
            let mut shutdown = self.signal.shutdown.lock();
            *shutdown = true;
        }
        self.signal.wake.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Background sync worker panicked.");
            }
        }
    }
}

fn run(inner: &Inner, signal: &Signal, interval: Duration) {
    trace!(interval_ms = interval.as_millis() as u64, "Sync worker started.");
    loop {
        {
            let mut shutdown = signal.shutdown.lock();
            if !*shutdown {
                let _ = signal.wake.wait_for(&mut shutdown, interval);
            }
            if *shutdown {
                break;
            }
        }
        inner.background_sync();
    }
    trace!("Sync worker stopped.");
}

//! Per-channel traffic counters.
//!
//! A channel created with `stat=yes` allocates one [`Stat`] block. The
//! post path counts outgoing DATA messages; transport impls count their
//! receive side. Blocks are registered in the context's [`StatList`] so an
//! exporter can walk every live channel's counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Traffic counters for one channel.
///
/// All counters are monotonic and updated with relaxed atomics; readers
/// get an eventually consistent snapshot, which is all an exporter needs.
#[derive(Debug, Default)]
pub struct Stat {
    name: Mutex<String>,
    rx: AtomicU64,
    rx_bytes: AtomicU64,
    tx: AtomicU64,
    tx_bytes: AtomicU64,
}

impl Stat {
    pub fn new() -> Arc<Self> {
        Arc::new(Stat::default())
    }

    /// The owning channel's name. Empty until the context binds it during
    /// channel construction.
    pub fn name(&self) -> String {
        self.name.lock().expect("stat name poisoned").clone()
    }

    pub(crate) fn set_name_if_empty(&self, name: &str) {
        let mut guard = self.name.lock().expect("stat name poisoned");
        if guard.is_empty() {
            *guard = name.to_string();
        }
    }

    /// Counts one received message of `bytes` payload bytes.
    pub fn update_rx(&self, bytes: usize) {
        self.rx.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts one sent message of `bytes` payload bytes.
    pub fn update_tx(&self, bytes: usize) {
        self.tx.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Snapshot as `(rx, rx_bytes, tx, tx_bytes)`.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.rx.load(Ordering::Relaxed),
            self.rx_bytes.load(Ordering::Relaxed),
            self.tx.load(Ordering::Relaxed),
            self.tx_bytes.load(Ordering::Relaxed),
        )
    }
}

/// The context-owned list of live stat blocks.
#[derive(Debug, Default)]
pub struct StatList {
    list: Mutex<Vec<Arc<Stat>>>,
}

impl StatList {
    pub(crate) fn add(&self, stat: Arc<Stat>) {
        self.list.lock().expect("stat list poisoned").push(stat);
    }

    pub(crate) fn remove(&self, stat: &Arc<Stat>) {
        let mut list = self.list.lock().expect("stat list poisoned");
        list.retain(|s| !Arc::ptr_eq(s, stat));
    }

    /// Snapshot of all registered blocks.
    pub fn iter(&self) -> Vec<Arc<Stat>> {
        self.list.lock().expect("stat list poisoned").clone()
    }
}

/*!
 * In-Memory Storage Implementation
 *
 * A single keyspace shared by every connection. Each entry may carry an
 * absolute deadline; an entry at or past its deadline is never returned,
 * whether or not it has been physically removed yet. Removal happens lazily
 * on read and, optionally, in a periodic background sweep.
 */

use bytes::Bytes;
use crossbeam::channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// AHash instead of SipHash for the keyspace
type AHash = BuildHasherDefault<ahash::AHasher>;

/// A stored value and its optional expiry deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Bytes,
    /// `None` means the key never expires
    pub expires_at: Option<Instant>,
}

impl Entry {
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

/// Thread-safe key-value store with per-key expiry
///
/// Every operation takes the single lock once, so get, set and sweep are
/// atomic with respect to each other.
#[derive(Default)]
pub struct Store {
    inner: Mutex<HashMap<Bytes, Entry, AHash>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`
    ///
    /// The previous entry, including its deadline, is discarded.
    #[inline]
    pub fn set(&self, key: Bytes, value: Bytes, expires_at: Option<Instant>) {
        self.inner.lock().insert(key, Entry { value, expires_at });
    }

    /// Look up `key` as of `now`
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &[u8], now: Instant) -> Option<Entry> {
        let mut map = self.inner.lock();
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                map.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Remove every entry whose deadline is at or before `now`
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut map = self.inner.lock();
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        before - map.len()
    }

    /// Number of physically present entries, expired ones included
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Handle to the background sweeper thread
///
/// Dropping the handle stops the thread; `stop` additionally waits for it.
pub struct Sweeper {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Closing the channel wakes the select below
        self.stop_tx.take();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a thread that sweeps `store` every `every`
pub fn spawn_sweeper(store: Arc<Store>, every: Duration) -> std::io::Result<Sweeper> {
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let ticker = tick(every);

    let thread = std::thread::Builder::new()
        .name("expiry-sweeper".into())
        .spawn(move || loop {
            select! {
                recv(ticker) -> _ => {
                    let removed = store.sweep(Instant::now());
                    if removed > 0 {
                        log::trace!("sweeper removed {} expired keys", removed);
                    }
                }
                recv(stop_rx) -> _ => break,
            }
        })?;

    Ok(Sweeper {
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn get_before_and_at_deadline() {
        let store = Store::new();
        let now = Instant::now();
        store.set(b("k"), b("v"), Some(now + Duration::from_millis(10)));

        let hit = store.get(b"k", now).expect("entry visible before deadline");
        assert_eq!(hit.value, b("v"));

        assert!(store.get(b"k", now + Duration::from_millis(10)).is_none());
        // Lazily deleted on that read
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn set_replaces_deadline() {
        let store = Store::new();
        let now = Instant::now();
        store.set(b("k"), b("v1"), Some(now + Duration::from_secs(10)));
        store.set(b("k"), b("v2"), None);

        let entry = store.get(b"k", now + Duration::from_secs(3600)).unwrap();
        assert_eq!(entry.value, b("v2"));
        assert_eq!(entry.expires_at, None);
    }

    #[test]
    fn sweep_only_removes_expired() {
        let store = Store::new();
        let now = Instant::now();
        store.set(b("gone"), b("1"), Some(now));
        store.set(b("later"), b("2"), Some(now + Duration::from_secs(60)));
        store.set(b("forever"), b("3"), None);

        assert_eq!(store.sweep(now), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(b"later", now).is_some());
        assert!(store.get(b"forever", now).is_some());
    }

    #[test]
    fn sweeper_thread_removes_unread_keys() {
        let store = Arc::new(Store::new());
        store.set(b("k"), b("v"), Some(Instant::now()));

        let sweeper = spawn_sweeper(store.clone(), Duration::from_millis(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !store.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();

        assert!(store.is_empty());
    }
}

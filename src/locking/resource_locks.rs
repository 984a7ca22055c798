//! Per-Resource Lock Table
//!
//! Named mutexes keyed by resource identity (a device path, an HBA host,
//! a volume name). Same-key callers serialize; different keys never contend.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;
use tracing::trace;

/// Default prefix applied to every lock name
pub const DEFAULT_LOCK_PREFIX: &str = "volume-attach-";

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Held lock on a single resource; released on drop.
///
/// The table entry goes away with the last guard when nobody else holds or
/// waits on it.
pub struct ResourceGuard {
    name: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    table: Arc<LockTable>,
}

impl ResourceGuard {
    /// Full (prefixed) lock name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.remove_if(&self.name, |_, mutex| {
            Arc::strong_count(mutex) == 1 && !mutex.is_locked()
        });
        trace!("Released lock {}", self.name);
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard").field("name", &self.name).finish()
    }
}

/// Lock table shared by connectors and the rescan engine
#[derive(Debug)]
pub struct ResourceLocks {
    prefix: String,
    locks: Arc<LockTable>,
}

impl ResourceLocks {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Shared handle, ready for injection
    pub fn shared(prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn mutex_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Block until the lock for `key` is held
    pub fn lock(&self, key: &str) -> ResourceGuard {
        let name = self.full_name(key);
        let mutex = self.mutex_for(&name);
        trace!("Acquiring lock {}", name);
        let guard = mutex.lock_arc();
        trace!("Acquired lock {}", name);
        ResourceGuard {
            name,
            guard: Some(guard),
            table: self.locks.clone(),
        }
    }

    /// Take the lock for `key` only if nobody holds it
    pub fn try_lock(&self, key: &str) -> Option<ResourceGuard> {
        let name = self.full_name(key);
        let mutex = self.mutex_for(&name);
        mutex.try_lock_arc().map(|guard| ResourceGuard {
            name,
            guard: Some(guard),
            table: self.locks.clone(),
        })
    }

    /// Run `f` while holding the lock for `key`
    pub fn synchronized<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock(key);
        f()
    }

    /// Whether `key` is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(&self.full_name(key))
            .map(|mutex| mutex.is_locked())
            .unwrap_or(false)
    }

    /// Number of lock entries in the table
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop entries nobody holds or waits on. Returns the number removed.
    ///
    /// Released guards clean up after themselves; this only catches entries
    /// left behind by a failed `try_lock`.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, mutex| Arc::strong_count(mutex) > 1 || mutex.is_locked());
        before.saturating_sub(self.locks.len())
    }
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_serializes() {
        let locks = ResourceLocks::shared("test-");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    locks.synchronized("scsi_host:host0", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_keys_run_in_parallel() {
        let locks = ResourceLocks::shared("test-");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["host0", "host2"]
            .into_iter()
            .map(|key| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let _guard = locks.lock(key);
                    // Both threads must hold their locks at the same time
                    barrier.wait();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_try_lock_and_release_on_drop() {
        let locks = ResourceLocks::new("volume-attach-");

        let guard = locks.lock("/dev/sdb");
        assert_eq!(guard.name(), "volume-attach-/dev/sdb");
        assert!(locks.is_locked("/dev/sdb"));
        assert!(locks.try_lock("/dev/sdb").is_none());
        assert!(locks.try_lock("/dev/sdc").is_some());

        drop(guard);
        assert!(!locks.is_locked("/dev/sdb"));
        assert!(locks.try_lock("/dev/sdb").is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let locks = Arc::new(ResourceLocks::default());
        let cloned = locks.clone();
        let result = thread::spawn(move || {
            cloned.synchronized("vol-1", || panic!("attach failed"));
        })
        .join();

        assert!(result.is_err());
        assert!(!locks.is_locked("vol-1"));
    }

    #[test]
    fn test_released_entries_leave_the_table() {
        let locks = ResourceLocks::default();
        let held = locks.lock("a");
        drop(locks.lock("b"));
        drop(locks.lock("c"));
        assert_eq!(locks.len(), 1);

        assert_eq!(locks.prune(), 0);
        drop(held);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_table_empties_after_many_distinct_keys() {
        let locks = ResourceLocks::shared("test-");
        for i in 0..500 {
            locks.synchronized(&format!("fc:volume-{}:1", i), || ());
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_contended_key_is_cleaned_up_by_last_holder() {
        let locks = ResourceLocks::shared("test-");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                thread::spawn(move || {
                    locks.synchronized("storpool:brick-1-vol", || {
                        thread::sleep(Duration::from_millis(2))
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(locks.is_empty());
    }
}

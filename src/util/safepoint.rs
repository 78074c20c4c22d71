//! A minimal safepoint protocol.
//!
//! Mutator threads hold a [`MutatorGuard`] while they may dereference shared metadata. A
//! [`SafepointGuard`] can only be obtained once every mutator guard has been dropped, and no
//! new mutator guard is handed out while it is alive. Operations that change the structure
//! of shared data (unlinking class loader data, replacing a mapping) take a
//! `&SafepointGuard` as proof that they run with all mutators parked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
pub struct SafepointSynchronizer {
    lock: RwLock<()>,
    at_safepoint: AtomicBool,
}

/// Held by a mutator thread while it runs.
pub struct MutatorGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Proof that all mutators are parked.
pub struct SafepointGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    sync: &'a SafepointSynchronizer,
}

impl SafepointSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter mutator state. Blocks while a safepoint is in progress.
    pub fn enter_mutator(&self) -> MutatorGuard<'_> {
        // A panic while holding a guard does not leave any data behind the lock inconsistent.
        let guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        MutatorGuard { _guard: guard }
    }

    /// Bring all mutators to a safepoint. Blocks until every mutator guard is dropped.
    pub fn begin(&self) -> SafepointGuard<'_> {
        let guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        self.at_safepoint.store(true, Ordering::SeqCst);
        trace!("Safepoint begin");
        SafepointGuard {
            _guard: guard,
            sync: self,
        }
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::SeqCst)
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        trace!("Safepoint end");
        self.sync.at_safepoint.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn safepoint_waits_for_mutators() {
        let sync = Arc::new(SafepointSynchronizer::new());
        let released = Arc::new(AtomicUsize::new(0));

        let mutator = sync.enter_mutator();
        let handle = {
            let sync = sync.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                let _sp = sync.begin();
                assert!(sync.is_at_safepoint());
                // The mutator guard must be gone by now.
                assert_eq!(released.load(Ordering::SeqCst), 1);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!sync.is_at_safepoint());
        released.store(1, Ordering::SeqCst);
        drop(mutator);
        handle.join().unwrap();
        assert!(!sync.is_at_safepoint());
    }
}

//! Per-key mutual exclusion.
//!
//! Operations on one entity key are serialized; different keys proceed
//! independently. A key is held by at most one [`KeyGuard`] at a time and is
//! released when the guard drops. Locks are not reentrant.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Table of currently held keys.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free, then takes it.
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(key) {
            self.released.wait(&mut held);
        }
        held.insert(key.to_string());
        KeyGuard {
            locks: self,
            key: key.to_string(),
        }
    }

    /// Takes `key` if it is free.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let mut held = self.held.lock();
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard {
            locks: self,
            key: key.to_string(),
        })
    }

    /// Returns true if `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    /// Returns the number of held keys.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Holds one key until dropped.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl KeyGuard<'_> {
    /// Returns the held key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
        self.locks.released.notify_all();
    }
}

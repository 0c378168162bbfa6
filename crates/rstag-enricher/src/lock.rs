//! Read/write lock with a locking-enabled switch.
//!
//! When locking is disabled both acquisitions are no-ops: readers rely on
//! the writer publishing snapshots by atomic pointer swap and never
//! mutating a published snapshot. When enabled, the write side excludes
//! readers so a delta may mutate the index in place.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct TagLock {
    enabled: bool,
    inner: RwLock<()>,
}

/// RAII read guard; empty when locking is disabled.
pub struct TagReadGuard<'a>(Option<RwLockReadGuard<'a, ()>>);

/// RAII write guard; empty when locking is disabled.
pub struct TagWriteGuard<'a>(Option<RwLockWriteGuard<'a, ()>>);

impl TagLock {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: RwLock::new(()),
        }
    }

    pub fn is_locking_enabled(&self) -> bool {
        self.enabled
    }

    pub fn read(&self) -> TagReadGuard<'_> {
        if self.enabled {
            TagReadGuard(Some(
                self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()),
            ))
        } else {
            TagReadGuard(None)
        }
    }

    pub fn write(&self) -> TagWriteGuard<'_> {
        if self.enabled {
            TagWriteGuard(Some(
                self.inner
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ))
        } else {
            TagWriteGuard(None)
        }
    }
}

impl TagReadGuard<'_> {
    pub fn is_locking_enabled(&self) -> bool {
        self.0.is_some()
    }
}

impl TagWriteGuard<'_> {
    pub fn is_locking_enabled(&self) -> bool {
        self.0.is_some()
    }
}

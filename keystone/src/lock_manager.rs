//! Blocking reader/writer locks on `(table, key)` resources.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{KeystoneError, Result};

/// The two lock modes. Readers share; writers are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// A lockable resource: one key within one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub table: String,
    pub key: i64,
}

#[derive(Default)]
struct LockState {
    readers: u64,
    writer: bool,
    // Grants outstanding against this entry; the entry is dropped at zero.
    refs: u64,
}

#[derive(Default)]
struct ResourceLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Maps resources to their lock state. The table-level mutex is held only
/// long enough to find or create an entry; waiting happens on the entry's
/// own condvar.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<Resource, Arc<ResourceLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `resource` in `mode`, blocking until compatible.
    pub fn lock(&self, resource: &Resource, mode: LockMode) {
        let entry = {
            let mut table = self.table.lock();
            let entry = table.entry(resource.clone()).or_default().clone();
            entry.state.lock().refs += 1;
            entry
        };
        let mut state = entry.state.lock();
        match mode {
            LockMode::Read => {
                while state.writer {
                    entry.cond.wait(&mut state);
                }
                state.readers += 1;
            }
            LockMode::Write => {
                while state.writer || state.readers > 0 {
                    entry.cond.wait(&mut state);
                }
                state.writer = true;
            }
        }
    }

    /// Release `resource` from `mode`. Fails with `NotHeld` when the
    /// resource is unknown or not held in that mode.
    pub fn unlock(&self, resource: &Resource, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        let entry = table.get(resource).cloned().ok_or(KeystoneError::NotHeld)?;
        let mut state = entry.state.lock();
        match mode {
            LockMode::Read => {
                if state.readers == 0 {
                    return Err(KeystoneError::NotHeld);
                }
                state.readers -= 1;
            }
            LockMode::Write => {
                if !state.writer {
                    return Err(KeystoneError::NotHeld);
                }
                state.writer = false;
            }
        }
        state.refs -= 1;
        let unused = state.refs == 0 && state.readers == 0 && !state.writer;
        drop(state);
        entry.cond.notify_all();
        if unused {
            table.remove(resource);
        }
        Ok(())
    }
}

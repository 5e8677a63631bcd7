//! # Port Table
//!
//! Bounded map from port name to open port, one per backend.
//!
//! The map itself sits behind one mutex that is held only for lookups,
//! inserts and removals. Each port has its own mutex held for the whole
//! operation, so a checked block or Visual Card exchange owns its port until
//! it returns. A second caller on the same port gets `Busy` instead of
//! interleaving bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::error::{Result, StarIoError};

/// Shared handle to one open port
pub type PortSlot<P> = Arc<Mutex<P>>;

pub struct PortTable<P> {
    capacity: usize,
    ports: Mutex<HashMap<String, PortSlot<P>>>,
}

impl<P> PortTable<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<String, PortSlot<P>>>> {
        self.ports
            .lock()
            .map_err(|_| StarIoError::Runtime("port table lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.map().map(|ports| ports.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map().map(|ports| ports.contains_key(name)).unwrap_or(false)
    }

    /// Fail with `NotOpen` unless `name` could be inserted right now.
    pub fn ensure_room(&self, name: &str) -> Result<()> {
        let ports = self.map()?;
        if ports.len() >= self.capacity {
            return Err(StarIoError::NotOpen(format!(
                "{}: all {} port slots in use",
                name, self.capacity
            )));
        }
        Ok(())
    }

    /// Insert a freshly opened port.
    ///
    /// If another caller opened the same name in the meantime, the existing
    /// entry wins and `port` is dropped.
    pub fn insert(&self, name: &str, port: P) -> Result<()> {
        let mut ports = self.map()?;
        if ports.contains_key(name) {
            return Ok(());
        }
        if ports.len() >= self.capacity {
            return Err(StarIoError::NotOpen(format!(
                "{}: all {} port slots in use",
                name, self.capacity
            )));
        }
        ports.insert(name.to_string(), Arc::new(Mutex::new(port)));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<PortSlot<P>> {
        self.map().ok().and_then(|mut ports| ports.remove(name))
    }

    /// Remove `name` only if it still maps to `slot`. A port reopened under
    /// the same name in the meantime stays.
    pub fn remove_slot(&self, name: &str, slot: &PortSlot<P>) -> bool {
        let Ok(mut ports) = self.map() else {
            return false;
        };
        match ports.get(name) {
            Some(current) if Arc::ptr_eq(current, slot) => ports.remove(name).is_some(),
            _ => false,
        }
    }

    /// Remove every port, returning them for shutdown.
    pub fn drain(&self) -> Vec<(String, PortSlot<P>)> {
        match self.map() {
            Ok(mut ports) => ports.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.map() {
            Ok(ports) => ports.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Shared handle to the named port, `NotOpen` if absent.
    pub fn slot(&self, name: &str) -> Result<PortSlot<P>> {
        self.map()?
            .get(name)
            .cloned()
            .ok_or_else(|| StarIoError::NotOpen(name.to_string()))
    }

    /// Run `op` with exclusive access to the named port.
    ///
    /// ## Errors
    ///
    /// - `NotOpen` if the name is not in the table
    /// - `Busy` if another operation holds the port
    pub fn with_port<T>(&self, name: &str, op: impl FnOnce(&mut P) -> Result<T>) -> Result<T> {
        let slot = self.slot(name)?;
        with_slot(&slot, name, op)
    }
}

/// Run `op` with exclusive access to an already looked-up port.
pub fn with_slot<P, T>(
    slot: &PortSlot<P>,
    name: &str,
    op: impl FnOnce(&mut P) -> Result<T>,
) -> Result<T> {
    let mut port = match slot.try_lock() {
        Ok(port) => port,
        Err(TryLockError::WouldBlock) => {
            return Err(StarIoError::Busy(format!(
                "{}: another operation is in progress",
                name
            )));
        }
        Err(TryLockError::Poisoned(_)) => {
            return Err(StarIoError::Runtime(format!("{}: port lock poisoned", name)));
        }
    };

    op(&mut port)
}

// ============================================================================
// TESTS
// ============================================================================

//! ==============================================================================
//! register.rs - the single authoritative live state
//! ==============================================================================
//!
//! one StateSnapshot, overwritten in place. created once in main and shared
//! through Arc.
//!
//! the `*_with` mutators run a `notify` callback before the write guard is
//! released. callers publish from there, so every event leaves in the same
//! order its change hit the register and always carries the flag that was
//! true at that moment. `observe` holds the read guard the same way, which
//! is how the hub takes the init snapshot.
//!
//! lock order is always register -> hub registry, never the reverse.
//! callbacks must not touch the register again (std RwLock is not reentrant).
//!
//! ==============================================================================

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::StateSnapshot;

pub struct StateRegister {
    snapshot: RwLock<StateSnapshot>,
}

impl StateRegister {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(StateSnapshot::initial()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StateSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateSnapshot> {
        match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn current(&self) -> StateSnapshot {
        self.read().clone()
    }

    /// run `f` while no mutation can start
    pub fn observe<R>(&self, f: impl FnOnce(&StateSnapshot) -> R) -> R {
        let guard = self.read();
        f(&guard)
    }

    #[cfg(test)]
    pub fn set_measurement(&self, alcohol: f64, timestamp: String) -> StateSnapshot {
        self.set_measurement_with(alcohol, timestamp, |_| {})
    }

    /// replace measurement and timestamp together, leaving the armed flag alone
    pub fn set_measurement_with(
        &self,
        alcohol: f64,
        timestamp: String,
        notify: impl FnOnce(&StateSnapshot),
    ) -> StateSnapshot {
        let mut guard = self.write();
        guard.alcohol = alcohol;
        guard.timestamp = timestamp;
        notify(&guard);
        guard.clone()
    }

    #[cfg(test)]
    pub fn set_armed(&self, armed: bool) -> bool {
        self.set_armed_with(armed, |_| {})
    }

    /// `notify` only fires when the flag actually changes
    pub fn set_armed_with(&self, armed: bool, notify: impl FnOnce(bool)) -> bool {
        let mut guard = self.write();
        if guard.activo != armed {
            guard.activo = armed;
            notify(armed);
        }
        armed
    }

    #[cfg(test)]
    pub fn toggle_armed(&self) -> bool {
        self.toggle_armed_with(|_| {})
    }

    /// read-modify-write under one write guard
    pub fn toggle_armed_with(&self, notify: impl FnOnce(bool)) -> bool {
        let mut guard = self.write();
        guard.activo = !guard.activo;
        notify(guard.activo);
        guard.activo
    }
}

impl Default for StateRegister {
    fn default() -> Self {
        Self::new()
    }
}

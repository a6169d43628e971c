//! Last-writer-wins boolean register.
//!
//! Every node holds one. An update carrying a newer timestamp wins; on an
//! exact timestamp tie `true` beats `false`. Any set of updates applied in
//! any order therefore leaves every node with the same pair.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use flipmesh_core::Timestamp;

/// Called with the new value each time an update is applied.
pub type StateHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Value and timestamp read together. Defaults to `false` at the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub value: bool,
    pub timestamp: Timestamp,
}

/// Whether `(value, timestamp)` replaces `current`.
pub fn supersedes(current: StateSnapshot, value: bool, timestamp: Timestamp) -> bool {
    timestamp > current.timestamp
        || (timestamp == current.timestamp && value != current.value && value)
}

#[derive(Default)]
pub struct StateRegister {
    // Held across read-modify-write and the handler call.
    serial: Mutex<()>,
    current: RwLock<StateSnapshot>,
    handler: RwLock<Option<StateHandler>>,
}

impl StateRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `(value, timestamp)` if it wins over the stored pair.
    ///
    /// Returns whether it was applied. On apply the handler runs before this
    /// returns, with updates still serialised, so handlers observe applied
    /// values in order. The handler may read the register but must not call
    /// `update` itself.
    pub fn update(&self, value: bool, timestamp: Timestamp) -> bool {
        let _serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);

        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if !supersedes(*current, value, timestamp) {
                tracing::trace!(value, ts = timestamp.as_nanos(), "stale state update ignored");
                return false;
            }
            *current = StateSnapshot { value, timestamp };
        }

        tracing::debug!(value, ts = timestamp.as_nanos(), "state updated");

        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(value);
        }
        true
    }

    pub fn get_state(&self) -> bool {
        self.snapshot().value
    }

    pub fn get_time(&self) -> Timestamp {
        self.snapshot().timestamp
    }

    pub fn snapshot(&self) -> StateSnapshot {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the change handler, replacing any previous one.
    pub fn set_event(&self, handler: impl Fn(bool) + Send + Sync + 'static) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear_event(&self) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for StateRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegister")
            .field("current", &self.snapshot())
            .finish()
    }
}

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use ecbus_core::error::Result;

/// Rendezvous between one blocked caller and the handler.
///
/// Each request owns its own ticket, so completing it wakes exactly the
/// caller that issued the request. The first outcome wins; later ones are
/// ignored.
#[derive(Debug)]
pub(crate) struct Ticket<T> {
    outcome: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

impl<T> Ticket<T> {
    pub(crate) fn new() -> Self {
        Self { outcome: Mutex::new(None), ready: Condvar::new() }
    }

    /// Stores the outcome and wakes the waiter. Returns false if the ticket
    /// was already completed.
    pub(crate) fn complete(&self, outcome: Result<T>) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.ready.notify_one();
        true
    }

    /// Takes the outcome without waiting.
    pub(crate) fn take(&self) -> Option<Result<T>> {
        self.lock().take()
    }

    /// Waits until the ticket is completed or `deadline` passes.
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<Result<T>> {
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Result<T>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

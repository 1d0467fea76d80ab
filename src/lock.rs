//! Tab-lock scheduler (C7)
//!
//! One FIFO wait queue per `(port, tab_id)`. A command that touches a tab
//! must hold that tab's lock for the duration of the round-trip; a second
//! session addressing the same tab queues behind the first rather than
//! racing it.

use crate::envelope::TabId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A tab is addressed by the extension port it lives behind plus its
/// extension-assigned tab id — two extensions can reuse the same tab id.
pub type TabKey = (u16, TabId);

/// What a queued waiter's oneshot resolves with — distinguishes "granted
/// the lock" from "removed because the waiting session was torn down",
/// so `acquire` can surface `Cancelled` rather than misreporting a
/// cancellation as a deadline timeout (spec §4.7 `Acquire` outcomes,
/// §7 `Cancelled` vs `LockAcquireTimeout`).
enum WaiterSignal {
    Granted,
    Cancelled,
}

struct Waiter {
    session_id: String,
    grant: oneshot::Sender<WaiterSignal>,
}

struct LockState {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
}

impl Default for LockState {
    fn default() -> Self {
        Self { holder: None, queue: VecDeque::new() }
    }
}

struct Holder {
    session_id: String,
    acquired_at: Instant,
}

/// Handle returned on successful acquisition; dropping it without calling
/// `release` still releases the lock (Drop impl below), the usual
/// RAII-guard pattern for held resources. Carries the owning session id so
/// release only clears the lock if this guard's holder is still current —
/// a guard for a holder that was since reclaimed as stale must not release
/// the next legitimate holder's lock out from under it: only the current
/// holder may release.
#[must_use]
pub struct TabLockGuard<'a> {
    scheduler: &'a TabLockScheduler,
    key: TabKey,
    session_id: String,
    released: bool,
}

impl<'a> TabLockGuard<'a> {
    pub fn release(mut self) {
        self.scheduler.release(self.key, &self.session_id);
        self.released = true;
    }
}

impl<'a> Drop for TabLockGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.scheduler.release(self.key, &self.session_id);
        }
    }
}

#[derive(Default)]
pub struct TabLockScheduler {
    locks: Mutex<HashMap<TabKey, LockState>>,
}

impl TabLockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting up to `timeout` if it is held.
    /// A stale holder — whose owning session is no longer registered, held
    /// for longer than `stale_after` — is reclaimed immediately rather than
    /// making a well-behaved session wait out someone else's crash.
    pub async fn acquire<'a>(
        &'a self,
        key: TabKey,
        session_id: &str,
        timeout: Duration,
        stale_after: Duration,
        session_is_live: impl Fn(&str) -> bool,
    ) -> Result<TabLockGuard<'a>, crate::error::BrokerError> {
        let rx = {
            let mut locks = self.locks.lock().unwrap();
            let state = locks.entry(key).or_default();

            if let Some(holder) = &state.holder {
                let stale = holder.acquired_at.elapsed() > stale_after && !session_is_live(&holder.session_id);
                if stale {
                    tracing::warn!(?key, stale_holder = %holder.session_id, "reclaiming stale tab lock");
                    state.holder = None;
                }
            }

            if state.holder.is_none() {
                state.holder = Some(Holder { session_id: session_id.to_string(), acquired_at: Instant::now() });
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter { session_id: session_id.to_string(), grant: tx });
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(WaiterSignal::Granted)) => {}
                Ok(Ok(WaiterSignal::Cancelled)) => {
                    return Err(crate::error::BrokerError::Cancelled("tab lock wait cancelled: session destroyed".into()));
                }
                // The sender was dropped without signaling — the only path that
                // happens on today is a bug, not a spec'd outcome, but treat it
                // as a cancellation rather than a timeout since "nobody will ever
                // grant this" is closer in meaning to "this wait is moot" than to
                // "the deadline passed".
                Ok(Err(_)) => return Err(crate::error::BrokerError::Cancelled("tab lock wait cancelled".into())),
                Err(_) => {
                    self.remove_waiter(key, session_id);
                    return Err(crate::error::BrokerError::LockAcquireTimeout);
                }
            }
        }

        Ok(TabLockGuard { scheduler: self, key, session_id: session_id.to_string(), released: false })
    }

    /// Removes `session_id`'s own queued waiter in place (no shifting of
    /// other waiters' positions) when its acquire attempt times out before
    /// being granted.
    fn remove_waiter(&self, key: TabKey, session_id: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(state) = locks.get_mut(&key) {
            state.queue.retain(|w| w.session_id != session_id);
        }
    }

    /// Releases the lock, granting it to the next waiter in FIFO order if
    /// any are queued. Atomic with respect to other `acquire`/`release`
    /// calls via the same mutex. A no-op (logged) if `session_id` is not
    /// the current holder — it was already reclaimed as stale and handed
    /// to someone else, and this guard is showing up late.
    fn release(&self, key: TabKey, session_id: &str) {
        let mut locks = self.locks.lock().unwrap();
        let Some(state) = locks.get_mut(&key) else { return };
        match &state.holder {
            Some(holder) if holder.session_id == session_id => {}
            Some(_) => {
                tracing::warn!(?key, %session_id, "ignoring release from a session that is no longer the lock holder");
                return;
            }
            None => return,
        }
        state.holder = None;
        while let Some(waiter) = state.queue.pop_front() {
            let session_id = waiter.session_id.clone();
            if waiter.grant.send(WaiterSignal::Granted).is_ok() {
                state.holder = Some(Holder { session_id, acquired_at: Instant::now() });
                break;
            }
            // Waiter already gave up (timed out/cancelled) between being
            // queued and being granted; try the next one.
        }
    }

    /// Removes every queued waiter belonging to `session_id`, across all
    /// tabs, when a session is torn down, signaling each removed waiter as
    /// `Cancelled` rather than merely dropping its sender — a waiter whose
    /// `acquire` call is still parked must see `Cancelled`, not a
    /// `LockAcquireTimeout` indistinguishable from its own deadline firing.
    /// Does not touch a lock the session currently holds — callers release
    /// held locks explicitly via the guard.
    pub fn cancel_session(&self, session_id: &str) {
        let mut locks = self.locks.lock().unwrap();
        for state in locks.values_mut() {
            let mut remaining = VecDeque::with_capacity(state.queue.len());
            while let Some(waiter) = state.queue.pop_front() {
                if waiter.session_id == session_id {
                    let _ = waiter.grant.send(WaiterSignal::Cancelled);
                } else {
                    remaining.push_back(waiter);
                }
            }
            state.queue = remaining;
        }
    }

    #[cfg(test)]
    pub fn queue_len(&self, key: TabKey) -> usize {
        self.locks.lock().unwrap().get(&key).map_or(0, |s| s.queue.len())
    }
}

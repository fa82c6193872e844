//! The priority-locked output scheduler.
//!
//! All frames leave the connection through one writer guarded by this
//! lock. Waiters are admitted highest-priority-first (FIFO within a
//! priority class) instead of FIFO; control frames use [`PRIORITY_MAX`]
//! so SETTINGS acks, PING replies, RST_STREAM and GOAWAY preempt queued
//! DATA writers.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Reserved for control frames.
pub(crate) const PRIORITY_MAX: u32 = u32::MAX;

struct State {
    locked: bool,
    next_seq: u64,
    /// `(priority, seq)` of parked waiters; small enough to scan.
    queue: Vec<(u32, u64)>,
}

pub(crate) struct PriorityLock<T> {
    value: UnsafeCell<T>,
    state: Mutex<State>,
    notify: Notify,
}

// The admission protocol guarantees at most one PriorityGuard exists at
// a time, so handing out `&mut T` from it is exclusive.
unsafe impl<T: Send> Send for PriorityLock<T> {}
unsafe impl<T: Send> Sync for PriorityLock<T> {}

pub(crate) struct PriorityGuard<'a, T> {
    lock: &'a PriorityLock<T>,
}

impl<T> PriorityLock<T> {
    pub(crate) fn new(value: T) -> PriorityLock<T> {
        PriorityLock {
            value: UnsafeCell::new(value),
            state: Mutex::new(State {
                locked: false,
                next_seq: 0,
                queue: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Acquires the lock, waiting behind any higher-priority waiter.
    pub(crate) async fn lock(&self, priority: u32) -> PriorityGuard<'_, T> {
        let seq = {
            let mut state = self.state.lock().unwrap();
            if !state.locked && state.queue.is_empty() {
                state.locked = true;
                return PriorityGuard { lock: self };
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push((priority, seq));
            seq
        };

        let mut ticket = Ticket {
            lock: self,
            seq,
            armed: true,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking so a release between
            // the check and the await is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if !state.locked && is_front(&state.queue, priority, seq) {
                    state.locked = true;
                    state.queue.retain(|&(_, s)| s != seq);
                    ticket.armed = false;
                    return PriorityGuard { lock: self };
                }
            }
            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.locked = false;
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

/// True when `(priority, seq)` is the next admission.
fn is_front(queue: &[(u32, u64)], priority: u32, seq: u64) -> bool {
    !queue
        .iter()
        .any(|&(p, s)| p > priority || (p == priority && s < seq))
}

/// Removes a cancelled waiter from the queue so it cannot block
/// admission of the others.
struct Ticket<'a, T> {
    lock: &'a PriorityLock<T>,
    seq: u64,
    armed: bool,
}

impl<T> Drop for Ticket<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.lock.state.lock().unwrap();
            state.queue.retain(|&(_, s)| s != self.seq);
            drop(state);
            self.lock.notify.notify_waiters();
        }
    }
}

impl<T> Deref for PriorityGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for PriorityGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for PriorityGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

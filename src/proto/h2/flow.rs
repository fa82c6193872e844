//! Flow-control windows (RFC 7540 §5.2).

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::Error;
use crate::proto::h2::Reason;

/// Largest legal window size, 2^31 - 1.
pub(crate) const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// A receive-side window, owned and accounted by the session thread.
#[derive(Debug)]
pub(crate) struct RecvWindow {
    window: i64,
}

impl RecvWindow {
    pub(crate) fn new(size: u32) -> RecvWindow {
        RecvWindow {
            window: size as i64,
        }
    }

    /// Charges `len` received DATA bytes against the window.
    pub(crate) fn consume(&mut self, len: u32) -> crate::Result<()> {
        self.window -= len as i64;
        if self.window < 0 {
            return Err(Error::new_h2_connection(
                Reason::FLOW_CONTROL_ERROR,
                "peer overran the advertised window",
            ));
        }
        Ok(())
    }

    pub(crate) fn replenish(&mut self, len: u32) {
        self.window += len as i64;
    }
}

/// A send-side window shared between the session (which applies
/// WINDOW_UPDATE and SETTINGS deltas) and the stream task spending it.
///
/// Tasks that find the window empty park on the notifier and are woken
/// by the next increment.
#[derive(Debug)]
pub(crate) struct SendWindow {
    window: Mutex<i64>,
    notify: Notify,
}

impl SendWindow {
    pub(crate) fn new(size: u32) -> SendWindow {
        SendWindow {
            window: Mutex::new(size as i64),
            notify: Notify::new(),
        }
    }

    /// Takes up to `max` bytes from the window; zero when exhausted.
    pub(crate) fn take(&self, max: usize) -> usize {
        let mut window = self.window.lock().unwrap();
        if *window <= 0 {
            return 0;
        }
        let granted = std::cmp::min(*window, max as i64);
        *window -= granted;
        granted as usize
    }

    /// Returns unspent bytes from an over-grant.
    pub(crate) fn put_back(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut window = self.window.lock().unwrap();
        *window += n as i64;
        drop(window);
        self.notify.notify_waiters();
    }

    /// Applies a WINDOW_UPDATE increment or a (possibly negative)
    /// `SETTINGS_INITIAL_WINDOW_SIZE` delta.
    pub(crate) fn add(&self, delta: i64) -> crate::Result<()> {
        let mut window = self.window.lock().unwrap();
        let next = *window + delta;
        if next > MAX_WINDOW_SIZE {
            return Err(Error::new_h2_connection(
                Reason::FLOW_CONTROL_ERROR,
                "window increment overflows 2^31-1",
            ));
        }
        *window = next;
        let positive = next > 0;
        drop(window);
        if positive {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// A future completing on the next increment. Create (and poll once)
    /// before re-checking the window, or a wakeup can be lost.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

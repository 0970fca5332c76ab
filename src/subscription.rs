//! Single-slot mailboxes carrying [`LogInfo`] updates to readers.
//!
//! Each subscriber owns one slot. Publishing overwrites whatever is in the
//! slot, so a slow subscriber never blocks the publisher and never sees a
//! backlog: it only ever observes the newest state.

use crate::error::{Error, Result};
use crate::log::LogInfo;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct Slot {
    info: Option<LogInfo>,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Mailbox {
    /// Replace the slot content with `info` and wake the waiter.
    pub(crate) fn publish(&self, info: LogInfo) {
        let mut slot = self.slot.lock();
        if slot.closed {
            return;
        }
        slot.info = Some(info);
        self.ready.notify_all();
    }

    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        self.ready.notify_all();
    }
}

/// A registration returned by [`Log::subscribe`](crate::Log::subscribe).
///
/// The current [`LogInfo`] is already waiting in the mailbox when the
/// subscription is handed out.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub(crate) fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Subscription {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            mailbox: Arc::new(Mailbox::default()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Take the pending update, if any, without blocking.
    pub fn try_recv(&self) -> Result<Option<LogInfo>> {
        let mut slot = self.mailbox.slot.lock();
        if let Some(info) = slot.info.take() {
            return Ok(Some(info));
        }
        if slot.closed {
            return Err(Error::Closed);
        }
        Ok(None)
    }

    /// Wait for the next update.
    ///
    /// Returns [`Error::Timeout`] once `deadline` passes and
    /// [`Error::Closed`] once the subscription is closed. A pending update is
    /// still delivered after close.
    pub fn recv(&self, deadline: Option<Instant>) -> Result<LogInfo> {
        let mut slot = self.mailbox.slot.lock();
        loop {
            if let Some(info) = slot.info.take() {
                return Ok(info);
            }
            if slot.closed {
                return Err(Error::Closed);
            }
            match deadline {
                None => self.mailbox.ready.wait(&mut slot),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.mailbox.ready.wait_until(&mut slot, deadline);
                }
            }
        }
    }

    /// Close the mailbox, waking any thread blocked in [`recv`](Self::recv).
    pub fn close(&self) {
        self.mailbox.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.slot.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn info(end: u64) -> LogInfo {
        LogInfo {
            end_position: end,
            ..LogInfo::default()
        }
    }

    #[test]
    fn keeps_only_latest() {
        let sub = Subscription::new();
        sub.mailbox().publish(info(1));
        sub.mailbox().publish(info(2));
        sub.mailbox().publish(info(3));
        assert_eq!(sub.try_recv().unwrap(), Some(info(3)));
        assert_eq!(sub.try_recv().unwrap(), None);
    }

    #[test]
    fn recv_times_out() {
        let sub = Subscription::new();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(sub.recv(Some(deadline)), Err(Error::Timeout)));
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let sub = Subscription::new();
        let waiter = sub.clone();
        let handle = thread::spawn(move || waiter.recv(None));
        thread::sleep(Duration::from_millis(50));
        sub.close();
        assert!(matches!(handle.join().unwrap(), Err(Error::Closed)));
    }

    #[test]
    fn publish_wakes_blocked_receiver() {
        let sub = Subscription::new();
        let waiter = sub.clone();
        let handle = thread::spawn(move || waiter.recv(None));
        thread::sleep(Duration::from_millis(50));
        sub.mailbox().publish(info(9));
        assert_eq!(handle.join().unwrap().unwrap(), info(9));
    }
}

//! Suspend/revive protocol.
//!
//! An operation that cannot complete returns [`Outcome::Suspend`] after
//! recording what it waits for in [`Descriptor::suspended`](crate::table::Descriptor).
//! A complementary event on another descriptor calls [`Driver::wake`] or one
//! of the select notifications, which flag the descriptor and put it on the
//! wake queue. The queue is drained at the end of each dispatch turn;
//! [`Driver::revive`] retries the suspended call and synthesizes the reply
//! the inline completion would have produced.

use tracing::{debug, trace};

use crate::control::ControlReply;
use crate::credentials::CredentialResolver;
use crate::driver::Driver;
use crate::error::UdsError;
use crate::files::FileBroker;
use crate::message::{Completion, Reply};
use crate::socket::SelectOps;
use crate::storage::ByteStore;
use crate::table::{Handle, Pending};

/// Result of an operation that may have to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Completed with a value.
    Done(T),
    /// Parked; no reply now.
    Suspend,
}

impl<T> Outcome<T> {
    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            Self::Suspend => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Done(value) => Outcome::Done(f(value)),
            Self::Suspend => Outcome::Suspend,
        }
    }
}

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    /// Mark a suspended descriptor ready to retry.
    pub(crate) fn wake(&mut self, handle: Handle) {
        let Some(desc) = self.table.get_mut(handle) else {
            return;
        };
        if desc.in_use() && desc.suspended.is_suspended() {
            desc.ready_to_revive = true;
            self.wake_queue.push_back(handle);
            trace!(handle = handle.0, pending = ?desc.suspended, "wake scheduled");
        }
    }

    /// Wake `handle` only if it is parked on `pending`.
    ///
    /// A blocked transfer must not wake a peer blocked in the same
    /// direction, or the two would keep retrying each other.
    pub(crate) fn wake_if(&mut self, handle: Handle, pending: Pending) {
        if self.table.get(handle).is_some_and(|d| d.suspended == pending) {
            self.wake(handle);
        }
    }

    /// A read on `handle` would no longer block.
    pub(crate) fn notify_readable(&mut self, handle: Handle) {
        self.notify(handle, SelectOps::read());
    }

    /// A write on `handle` would no longer block.
    pub(crate) fn notify_writable(&mut self, handle: Handle) {
        self.notify(handle, SelectOps::write());
    }

    fn notify(&mut self, handle: Handle, ops: SelectOps) {
        let Some(desc) = self.table.get_mut(handle) else {
            return;
        };
        if !desc.in_use() || !desc.select.selecting {
            return;
        }
        let fresh = ops
            .intersect(desc.select.interest)
            .difference(desc.select.ready);
        if !fresh.any() {
            return;
        }
        desc.select.ready.insert(fresh);
        desc.select.status_updated = true;
        self.wake_queue.push_back(handle);
        trace!(handle = handle.0, ready = ?desc.select.ready, "select status updated");
    }

    /// Produce the deferred reply for `handle`, if one is due.
    ///
    /// A pending select update takes priority over a suspended call. A
    /// retried call that has to wait again yields `None` and stays parked.
    pub fn revive(&mut self, handle: Handle) -> Option<Reply> {
        let desc = self.table.get_mut(handle).filter(|d| d.in_use())?;

        if desc.select.status_updated {
            desc.select.status_updated = false;
            desc.select.selecting = false;
            return Some(Reply::Select {
                handle,
                source: desc.select.source,
                result: Ok(desc.select.ready),
                deferred: true,
            });
        }

        if !desc.ready_to_revive {
            return None;
        }
        desc.ready_to_revive = false;
        let endpoint = desc.endpoint;
        let grant = desc.pending_io.grant;

        let pending = desc.suspended;
        let result = match pending {
            Pending::NotSuspended => return None,
            Pending::Read => {
                let size = desc.pending_io.size;
                match self.perform_read(handle, size) {
                    Ok(outcome) => Ok(Completion::Data(outcome.done()?)),
                    Err(e) => Err(e),
                }
            }
            Pending::Write => {
                let data = std::mem::take(&mut desc.pending_io.data);
                match self.perform_write(handle, &data) {
                    Ok(Outcome::Suspend) => {
                        self.table[handle].pending_io.data = data;
                        return None;
                    }
                    Ok(Outcome::Done(n)) => Ok(Completion::Written(n)),
                    Err(e) => Err(e),
                }
            }
            Pending::Connect => match desc.take_err_if(&UdsError::ConnectionRefused) {
                Some(e) => {
                    desc.addr = None;
                    Err(e)
                }
                None => Ok(Completion::Control(ControlReply::Done)),
            },
            Pending::Accept => Ok(Completion::Control(ControlReply::Done)),
        };

        let desc = &mut self.table[handle];
        desc.suspended = Pending::NotSuspended;
        desc.syscall_done = true;
        desc.pending_io.data.clear();
        debug!(handle = handle.0, ok = result.is_ok(), "suspended call revived");
        Some(Reply::Revive {
            handle,
            endpoint,
            grant,
            result,
        })
    }

    /// Revive every queued descriptor, collecting the replies produced.
    pub(crate) fn drain_wakeups(&mut self) -> Vec<Reply> {
        let mut replies = Vec::new();
        while let Some(handle) = self.wake_queue.pop_front() {
            if let Some(reply) = self.revive(handle) {
                replies.push(reply);
            }
        }
        replies
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::message::Endpoint;

    fn driver() -> MemoryDriver {
        MemoryDriver::in_memory(crate::config::DriverConfig {
            table_size: 8,
            buffer_capacity: 16,
            ..Default::default()
        })
    }

    #[test]
    fn test_outcome_helpers() {
        let done: Outcome<u8> = Outcome::Done(3);
        assert_eq!(done.clone().map(|v| v * 2), Outcome::Done(6));
        assert_eq!(done.done(), Some(3));
        assert!(Outcome::<u8>::Suspend.is_suspend());
    }

    #[test]
    fn test_wake_ignores_running_descriptor() {
        let mut drv = driver();
        let h = drv.open(Endpoint(1)).unwrap();
        drv.wake(h);
        assert!(!drv.table()[h].ready_to_revive);
        assert!(drv.drain_wakeups().is_empty());
    }

    #[test]
    fn test_revive_without_event_is_silent() {
        let mut drv = driver();
        let h = drv.open(Endpoint(1)).unwrap();
        assert_eq!(drv.revive(h), None);
        assert_eq!(drv.revive(Handle(7)), None);
    }

    #[test]
    fn test_select_update_has_priority() {
        let mut drv = driver();
        let h = drv.open(Endpoint(1)).unwrap();
        {
            let desc = drv.table.in_use_mut(h).unwrap();
            desc.select.selecting = true;
            desc.select.source = Endpoint(9);
            desc.select.interest = SelectOps::read();
            desc.suspended = Pending::Accept;
        }
        drv.notify_readable(h);
        drv.wake(h);

        let first = drv.revive(h).unwrap();
        assert!(matches!(
            first,
            Reply::Select { deferred: true, source: Endpoint(9), result: Ok(ops), .. } if ops == SelectOps::read()
        ));
        assert!(!drv.table()[h].select.selecting);

        let second = drv.revive(h).unwrap();
        assert!(matches!(second, Reply::Revive { result: Ok(_), .. }));
        assert_eq!(drv.table()[h].suspended, Pending::NotSuspended);
        assert!(drv.table()[h].syscall_done);
    }

    #[test]
    fn test_notify_only_new_interest() {
        let mut drv = driver();
        let h = drv.open(Endpoint(1)).unwrap();
        {
            let desc = drv.table.in_use_mut(h).unwrap();
            desc.select.selecting = true;
            desc.select.interest = SelectOps::write();
        }
        drv.notify_readable(h);
        assert!(!drv.table()[h].select.status_updated);
        drv.notify_writable(h);
        assert!(drv.table()[h].select.status_updated);
        let replies = drv.drain_wakeups();
        assert_eq!(replies.len(), 1);
    }
}

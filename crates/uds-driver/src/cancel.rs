//! Cancellation of in-flight calls.
//!
//! A cancel arrives when the caller blocked in a suspended call is
//! interrupted. Whatever the call had already changed in other descriptors
//! is rolled back: a partial accept registered itself as a listener's
//! child, a partial connect sits in a backlog with its address set.

use tracing::debug;

use crate::control::ControlCode;
use crate::credentials::CredentialResolver;
use crate::driver::Driver;
use crate::error::UdsError;
use crate::files::FileBroker;
use crate::message::Endpoint;
use crate::revive::Outcome;
use crate::storage::ByteStore;
use crate::table::{Call, Handle, Pending, PendingIo};

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    /// Interrupt the call in flight on `handle`.
    ///
    /// Returns `Outcome::Suspend` (no reply) for a slot that is not in use,
    /// otherwise the error to reply with.
    pub fn cancel(&mut self, handle: Handle, endpoint: Endpoint) -> Outcome<UdsError> {
        if !self.table.is_in_use(handle) {
            debug!(handle = handle.0, "cancel for unknown socket ignored");
            return Outcome::Suspend;
        }

        let desc = &mut self.table[handle];
        desc.endpoint = endpoint;
        desc.select.selecting = false;
        desc.suspended = Pending::NotSuspended;
        desc.ready_to_revive = false;
        desc.pending_io = PendingIo::default();
        let rollback = if desc.syscall_done { None } else { desc.call };
        desc.syscall_done = true;

        match rollback {
            Some(Call::Control(ControlCode::Accept)) => {
                for other in self.table.handles() {
                    if self.table[other].child == Some(handle) {
                        self.table[other].child = None;
                    }
                }
                debug!(handle = handle.0, "accept rolled back");
            }
            Some(Call::Control(ControlCode::Connect)) => {
                for other in self.table.handles() {
                    self.table[other].backlog.retain(|&h| h != handle);
                }
                self.table[handle].addr = None;
                debug!(handle = handle.0, "connect rolled back");
            }
            _ => {}
        }
        Outcome::Done(UdsError::Interrupted)
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::control::ControlOp;
    use crate::driver::MemoryDriver;
    use crate::message::GrantId;
    use crate::socket::{SocketType, UnixAddress};

    fn driver() -> MemoryDriver {
        MemoryDriver::in_memory(DriverConfig {
            table_size: 8,
            buffer_capacity: 16,
            ..Default::default()
        })
    }

    fn listener(drv: &mut MemoryDriver) -> Handle {
        let l = drv.open(Endpoint(1)).unwrap();
        drv.set_type(l, SocketType::Stream).unwrap();
        drv.bind(l, UnixAddress::new("/srv")).unwrap();
        drv.listen(l, 4).unwrap();
        l
    }

    #[test]
    fn test_cancel_unknown_socket() {
        let mut drv = driver();
        assert_eq!(drv.cancel(Handle(4), Endpoint(1)), Outcome::Suspend);
    }

    #[test]
    fn test_cancel_accept_clears_child() {
        let mut drv = driver();
        let l = listener(&mut drv);
        let s = drv.open(Endpoint(2)).unwrap();
        let outcome = drv
            .control(s, Endpoint(2), GrantId(1), ControlOp::Accept(UnixAddress::new("/srv")))
            .unwrap();
        assert!(outcome.is_suspend());
        assert_eq!(drv.table()[l].child, Some(s));

        assert_eq!(drv.cancel(s, Endpoint(2)), Outcome::Done(UdsError::Interrupted));
        assert_eq!(drv.table()[l].child, None);
        assert_eq!(drv.table()[s].suspended, Pending::NotSuspended);
    }

    #[test]
    fn test_cancel_connect_leaves_backlog() {
        let mut drv = driver();
        let l = listener(&mut drv);
        let c = drv.open(Endpoint(3)).unwrap();
        drv.set_type(c, SocketType::Stream).unwrap();
        let outcome = drv
            .control(c, Endpoint(3), GrantId(2), ControlOp::Connect(UnixAddress::new("/srv")))
            .unwrap();
        assert!(outcome.is_suspend());

        assert_eq!(drv.cancel(c, Endpoint(3)), Outcome::Done(UdsError::Interrupted));
        assert!(drv.table()[l].backlog.is_empty());
        assert_eq!(drv.table()[c].addr, None);
    }

    #[test]
    fn test_cancel_completed_call_keeps_state() {
        let mut drv = driver();
        let l = listener(&mut drv);
        let s = drv.open(Endpoint(2)).unwrap();
        drv.table[l].child = Some(s);
        // The last call on `s` was open, which has completed.
        assert_eq!(drv.cancel(s, Endpoint(2)), Outcome::Done(UdsError::Interrupted));
        assert_eq!(drv.table()[l].child, Some(s));
    }

    #[test]
    fn test_cancel_suspended_read() {
        let mut drv = driver();
        let a = drv.open(Endpoint(1)).unwrap();
        let b = drv.open(Endpoint(2)).unwrap();
        drv.socketpair(a, b).unwrap();
        assert!(drv.read(b, Endpoint(2), GrantId(9), 4).unwrap().is_suspend());
        assert_eq!(drv.cancel(b, Endpoint(2)), Outcome::Done(UdsError::Interrupted));

        // Data arriving later does not revive the cancelled read.
        drv.write(a, Endpoint(1), GrantId(1), b"late".to_vec()).unwrap();
        assert!(drv.drain_wakeups().is_empty());
        assert_eq!(drv.table()[b].len, 4);
    }
}

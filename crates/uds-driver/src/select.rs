//! Readiness tracking for select(2).
//!
//! A select request gets an immediate snapshot computed with the probe
//! variants of read and write. Interests that are not yet satisfied stay
//! registered; later transfers and connects flag them and the selector gets
//! a second, deferred reply through the revive path.

use tracing::trace;

use crate::credentials::CredentialResolver;
use crate::driver::Driver;
use crate::error::Result;
use crate::files::FileBroker;
use crate::message::Endpoint;
use crate::revive::Outcome;
use crate::socket::SelectOps;
use crate::storage::ByteStore;
use crate::table::{Call, Handle};

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    /// Register `interest` on behalf of `source` and return what is ready now.
    pub fn select(&mut self, handle: Handle, source: Endpoint, interest: SelectOps) -> Result<SelectOps> {
        let desc = self.table.in_use_mut(handle)?;
        desc.begin_call(Call::Select);
        desc.select.selecting = true;
        desc.select.source = source;
        desc.select.interest = interest;
        desc.select.ready = SelectOps::none();
        desc.select.status_updated = false;
        let listening = desc.listening;
        let backlogged = !desc.backlog.is_empty();

        let mut ready = SelectOps::none();

        // Errors and end-of-file count as readable: the read will not block.
        let probe = self.probe_read(handle, 1);
        ready.read = match probe {
            Ok(Outcome::Done(n)) if n > 0 => true,
            _ if listening => backlogged,
            Ok(Outcome::Suspend) => false,
            _ => true,
        };

        ready.write = match self.probe_write(handle, self.config.buffer_capacity) {
            Ok(Outcome::Done(0)) | Ok(Outcome::Suspend) => false,
            Ok(Outcome::Done(_)) | Err(_) => true,
        };

        let ready = ready.intersect(interest);
        let desc = &mut self.table[handle];
        desc.select.ready = ready;
        desc.syscall_done = true;
        trace!(handle = handle.0, ?interest, ?ready, "select snapshot");
        Ok(ready)
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

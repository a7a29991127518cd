//! I/O transfer engine.
//!
//! Each socket's receive buffer is a FIFO window `[pos, pos + len)` in its
//! backing container. A write appends to the peer's window; a read consumes
//! from its own. The probe variants answer "would this block, and how much
//! would move" without touching any state, which is what select needs.

use tracing::{debug, trace};

use crate::credentials::CredentialResolver;
use crate::driver::Driver;
use crate::error::{Result, UdsError};
use crate::files::FileBroker;
use crate::revive::Outcome;
use crate::socket::SocketType;
use crate::storage::ByteStore;
use crate::table::{Handle, Pending};

enum ReadPlan {
    /// Complete with no bytes: zero-sized request or end-of-file.
    Nothing,
    Available(usize),
    /// Buffer empty; block, nudging the peer if there is one.
    Empty(Option<Handle>),
}

enum WritePlan {
    Nothing,
    /// No datagram socket is bound to the target.
    NoTarget,
    /// Datagram into an occupied buffer; silently discarded.
    Discard,
    /// Not enough room in the peer's buffer yet.
    Full(Handle),
    Deliver(Handle),
}

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    // -----------------------------------------------------------------------
    //  Read
    // -----------------------------------------------------------------------

    fn plan_read(&mut self, handle: Handle, size: usize, consume: bool) -> Result<ReadPlan> {
        let desc = self.table.in_use_mut(handle)?;
        if size == 0 {
            return Ok(ReadPlan::Nothing);
        }
        if !desc.mode.readable {
            return Err(UdsError::BrokenPipe);
        }
        if desc.len > 0 {
            return Ok(ReadPlan::Available(size.min(desc.len)));
        }
        let peer = desc.peer;
        if peer.is_none() && desc.is_connection_oriented() {
            return Err(desc.disconnected(consume));
        }
        if let Some(peer) = peer {
            if !self.table[peer].mode.writable {
                return Ok(ReadPlan::Nothing);
            }
        }
        Ok(ReadPlan::Empty(peer))
    }

    /// Consume up to `size` bytes from the socket's receive buffer.
    pub(crate) fn perform_read(&mut self, handle: Handle, size: usize) -> Result<Outcome<Vec<u8>>> {
        let count = match self.plan_read(handle, size, true)? {
            ReadPlan::Nothing => return Ok(Outcome::Done(Vec::new())),
            ReadPlan::Empty(peer) => {
                // A writer may be parked on a full buffer the other way.
                if let Some(peer) = peer {
                    self.wake_if(peer, Pending::Write);
                }
                self.table[handle].suspended = Pending::Read;
                trace!(handle = handle.0, size, "read suspended");
                return Ok(Outcome::Suspend);
            }
            ReadPlan::Available(count) => count,
        };

        let desc = &self.table[handle];
        let data = self.store.read(desc.container, desc.pos, count)?;
        let peer = desc.peer;

        let desc = &mut self.table[handle];
        desc.pos += data.len();
        desc.len -= data.len();
        if desc.len == 0 {
            desc.pos = 0;
        }
        let room = desc.pos + desc.len + 1 < self.config.buffer_capacity;
        trace!(handle = handle.0, bytes = data.len(), remaining = desc.len, "read");

        if let Some(peer) = peer {
            self.wake(peer);
            if room {
                self.notify_writable(peer);
            }
        }
        Ok(Outcome::Done(data))
    }

    /// How many bytes a read of `size` would return, without consuming them.
    pub(crate) fn probe_read(&mut self, handle: Handle, size: usize) -> Result<Outcome<usize>> {
        Ok(match self.plan_read(handle, size, false)? {
            ReadPlan::Nothing => Outcome::Done(0),
            ReadPlan::Available(count) => Outcome::Done(count),
            ReadPlan::Empty(_) => Outcome::Suspend,
        })
    }

    // -----------------------------------------------------------------------
    //  Write
    // -----------------------------------------------------------------------

    fn plan_write(&mut self, handle: Handle, size: usize, consume: bool) -> Result<WritePlan> {
        let capacity = self.config.buffer_capacity;
        let desc = self.table.in_use_mut(handle)?;
        if size == 0 {
            return Ok(WritePlan::Nothing);
        }
        if !desc.mode.writable {
            return Err(UdsError::BrokenPipe);
        }
        if size > capacity {
            return Err(UdsError::MessageTooLarge {
                size,
                max: capacity,
            });
        }

        let socket_type = desc.socket_type;
        let linked = desc.peer;
        let peer = if desc.is_connection_oriented() {
            match linked {
                Some(peer) => peer,
                None => return Err(desc.disconnected(consume)),
            }
        } else {
            let target = desc.target.clone();
            match target.and_then(|t| self.datagram_bound_to(&t)) {
                Some(peer) => peer,
                None => return Ok(WritePlan::NoTarget),
            }
        };

        let dest = &self.table[peer];
        if !dest.mode.readable {
            return Err(UdsError::BrokenPipe);
        }
        // Datagram boundaries are kept by holding one message at a time.
        if socket_type == Some(SocketType::Datagram) && dest.len > 0 {
            return Ok(WritePlan::Discard);
        }
        if dest.pos + dest.len + size > capacity
            || (socket_type == Some(SocketType::SeqPacket) && dest.len > 0)
        {
            return Ok(WritePlan::Full(peer));
        }
        Ok(WritePlan::Deliver(peer))
    }

    /// Append `data` to the peer's receive buffer.
    pub(crate) fn perform_write(&mut self, handle: Handle, data: &[u8]) -> Result<Outcome<usize>> {
        let size = data.len();
        let peer = match self.plan_write(handle, size, true)? {
            WritePlan::Nothing => return Ok(Outcome::Done(0)),
            WritePlan::NoTarget => return Err(UdsError::NoSuchTarget),
            WritePlan::Discard => {
                debug!(handle = handle.0, size, "datagram dropped, receiver busy");
                return Ok(Outcome::Done(size));
            }
            WritePlan::Full(peer) => {
                self.wake_if(peer, Pending::Read);
                self.table[handle].suspended = Pending::Write;
                trace!(handle = handle.0, size, "write suspended");
                return Ok(Outcome::Suspend);
            }
            WritePlan::Deliver(peer) => peer,
        };

        let dest = &self.table[peer];
        let written = self
            .store
            .write(dest.container, dest.pos + dest.len, data)?;

        let src = &self.table[handle];
        let source = (src.socket_type == Some(SocketType::Datagram)).then(|| src.addr.clone());
        let dest = &mut self.table[peer];
        dest.len += written;
        if let Some(source) = source {
            dest.source = source;
        }
        trace!(handle = handle.0, peer = peer.0, bytes = written, "write");

        self.wake(peer);
        self.notify_readable(peer);
        Ok(Outcome::Done(written))
    }

    /// How many bytes a write of `size` would accept, without writing.
    pub(crate) fn probe_write(&mut self, handle: Handle, size: usize) -> Result<Outcome<usize>> {
        Ok(match self.plan_write(handle, size, false)? {
            WritePlan::Nothing => Outcome::Done(0),
            WritePlan::Discard | WritePlan::Deliver(_) => Outcome::Done(size),
            WritePlan::NoTarget | WritePlan::Full(_) => Outcome::Suspend,
        })
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

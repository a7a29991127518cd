//! Descriptor table.
//!
//! A fixed arena of socket descriptors. The slot index is the socket's
//! handle (the device minor); slot 0 belongs to the control device and is
//! never allocated. Cross references between descriptors (`peer`, `child`,
//! `backlog`) are handles into the same arena.

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::control::ControlCode;
use crate::credentials::Credentials;
use crate::error::{Result, UdsError};
use crate::files::FileRef;
use crate::message::{Endpoint, GrantId};
use crate::socket::{Mode, SelectOps, SocketType, UnixAddress};
use crate::storage::ContainerId;

// ---------------------------------------------------------------------------
//  Handle
// ---------------------------------------------------------------------------

/// Index of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u32);

impl Handle {
    /// Slot of the control device itself.
    pub const CONTROL: Handle = Handle(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uds#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
//  Descriptor state
// ---------------------------------------------------------------------------

/// Slot allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Free,
    InUse,
}

/// What a suspended descriptor is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pending {
    #[default]
    NotSuspended,
    Read,
    Write,
    Connect,
    Accept,
}

impl Pending {
    pub fn is_suspended(self) -> bool {
        self != Pending::NotSuspended
    }
}

/// The call a descriptor is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Open,
    Read,
    Write,
    Select,
    Control(ControlCode),
}

/// select(2) bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SelectState {
    pub selecting: bool,
    /// Process waiting for the deferred readiness reply.
    pub source: Endpoint,
    pub interest: SelectOps,
    pub ready: SelectOps,
    /// A deferred readiness reply is due.
    pub status_updated: bool,
}

/// Ancillary data queued for the next `recvmsg`.
#[derive(Debug, Clone, Default)]
pub struct Ancillary {
    pub files: Vec<FileRef>,
    pub credentials: Option<Credentials>,
}

/// The caller's buffer for the in-flight read or write.
#[derive(Debug, Clone, Default)]
pub struct PendingIo {
    pub grant: GrantId,
    pub size: usize,
    /// Payload of a write, kept until the write completes.
    pub data: Vec<u8>,
}

/// One socket.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    pub state: SlotState,
    /// `None` until the set-type control runs.
    pub socket_type: Option<SocketType>,
    pub mode: Mode,
    /// Process that issued the last control operation.
    pub owner: Endpoint,
    /// Process that receives completion replies.
    pub endpoint: Endpoint,
    /// Receive buffer; valid whenever the slot is in use.
    pub container: ContainerId,
    /// Start of unread data in the container.
    pub pos: usize,
    /// Number of unread bytes.
    pub len: usize,
    pub peer: Option<Handle>,
    pub backlog: VecDeque<Handle>,
    pub backlog_size: usize,
    pub listening: bool,
    /// Descriptor blocked in accept on this listener.
    pub child: Option<Handle>,
    pub addr: Option<UnixAddress>,
    /// Sender of the last datagram received.
    pub source: Option<UnixAddress>,
    /// Destination of datagram writes.
    pub target: Option<UnixAddress>,
    pub suspended: Pending,
    pub ready_to_revive: bool,
    pub call: Option<Call>,
    pub syscall_done: bool,
    pub select: SelectState,
    pub ancillary: Ancillary,
    pub pending_io: PendingIo,
    /// Sticky error delivered once by the next read or write.
    pub err: Option<UdsError>,
}

impl Descriptor {
    /// A freshly opened socket: readable, writable, untyped, unbound.
    pub fn opened(endpoint: Endpoint, backlog_size: usize) -> Self {
        Self {
            state: SlotState::InUse,
            mode: Mode::READ_WRITE,
            owner: endpoint,
            endpoint,
            backlog_size,
            call: Some(Call::Open),
            ..Self::default()
        }
    }

    pub fn in_use(&self) -> bool {
        self.state == SlotState::InUse
    }

    pub fn is_connection_oriented(&self) -> bool {
        self.socket_type
            .is_some_and(SocketType::is_connection_oriented)
    }

    /// Record the call being served so a cancel can roll it back.
    pub fn begin_call(&mut self, call: Call) {
        self.call = Some(call);
        self.syscall_done = false;
    }

    /// Error for a connection-oriented socket without a peer: the latched
    /// reset if there is one, else not-connected. The latch is only
    /// consumed when `consume` is set.
    pub fn disconnected(&mut self, consume: bool) -> UdsError {
        if consume {
            self.take_err_if(&UdsError::ConnectionReset)
                .unwrap_or(UdsError::NotConnected)
        } else if self.err == Some(UdsError::ConnectionReset) {
            UdsError::ConnectionReset
        } else {
            UdsError::NotConnected
        }
    }

    /// Take the latched error if it is `kind`.
    pub fn take_err_if(&mut self, kind: &UdsError) -> Option<UdsError> {
        if self.err.as_ref() == Some(kind) {
            self.err.take()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
//  Table
// ---------------------------------------------------------------------------

/// Fixed-size table of descriptors.
#[derive(Debug)]
pub struct DescriptorTable {
    slots: Vec<Descriptor>,
}

impl DescriptorTable {
    /// Create a table with `size` slots, including the control slot.
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![Descriptor::default(); size],
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Descriptor in any state, if the handle is in range.
    pub fn get(&self, handle: Handle) -> Option<&Descriptor> {
        self.slots.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Descriptor> {
        self.slots.get_mut(handle.index())
    }

    /// Whether the handle names an open socket.
    pub fn is_in_use(&self, handle: Handle) -> bool {
        handle != Handle::CONTROL && self.get(handle).is_some_and(Descriptor::in_use)
    }

    /// Descriptor of an open socket.
    pub fn in_use(&self, handle: Handle) -> Result<&Descriptor> {
        if !self.is_in_use(handle) {
            return Err(UdsError::InvalidHandle { handle: handle.0 });
        }
        Ok(&self.slots[handle.index()])
    }

    pub fn in_use_mut(&mut self, handle: Handle) -> Result<&mut Descriptor> {
        if !self.is_in_use(handle) {
            return Err(UdsError::InvalidHandle { handle: handle.0 });
        }
        Ok(&mut self.slots[handle.index()])
    }

    /// First free slot after the control slot.
    pub fn find_free(&self) -> Result<Handle> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, d)| d.state == SlotState::Free)
            .map(|(i, _)| Handle(i as u32))
            .ok_or(UdsError::TooManyOpen)
    }

    /// Return a slot to its zeroed, free state.
    pub fn reset(&mut self, handle: Handle) {
        if let Some(slot) = self.slots.get_mut(handle.index()) {
            *slot = Descriptor::default();
        }
    }

    /// Handles of every open socket, in slot order.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// Open sockets with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Descriptor)> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, d)| d.in_use())
            .map(|(i, d)| (Handle(i as u32), d))
    }

    /// Number of open sockets.
    pub fn open_count(&self) -> usize {
        self.iter().count()
    }

    /// Link two descriptors as peers, giving both the same address.
    pub fn link(&mut self, a: Handle, b: Handle, addr: Option<UnixAddress>) {
        self[a].peer = Some(b);
        self[a].addr = addr.clone();
        self[b].peer = Some(a);
        self[b].addr = addr;
    }

    /// Remove every reference other descriptors hold to `handle`.
    pub fn forget(&mut self, handle: Handle) {
        for slot in self.slots.iter_mut().filter(|d| d.in_use()) {
            slot.backlog.retain(|&h| h != handle);
            if slot.child == Some(handle) {
                slot.child = None;
            }
            if slot.peer == Some(handle) {
                slot.peer = None;
            }
        }
    }
}

impl Index<Handle> for DescriptorTable {
    type Output = Descriptor;

    fn index(&self, handle: Handle) -> &Descriptor {
        &self.slots[handle.index()]
    }
}

impl IndexMut<Handle> for DescriptorTable {
    fn index_mut(&mut self, handle: Handle) -> &mut Descriptor {
        &mut self.slots[handle.index()]
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

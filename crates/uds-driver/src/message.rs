//! Request and reply messages exchanged with the file server.
//!
//! A request names the socket by [`Handle`]. Every request produces at most
//! one immediate reply; a request that suspends produces none, and its
//! reply is synthesized later by a revive. Select can produce a second,
//! deferred reply.

use serde::{Deserialize, Serialize};

use crate::control::{ControlOp, ControlReply};
use crate::error::UdsError;
use crate::socket::SelectOps;
use crate::table::Handle;

/// A client process as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Endpoint(pub i32);

/// Reference to the caller's I/O buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GrantId(pub u32);

/// An inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Open {
        endpoint: Endpoint,
    },
    Close {
        handle: Handle,
        endpoint: Endpoint,
    },
    Read {
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        size: usize,
    },
    Write {
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        data: Vec<u8>,
    },
    Select {
        handle: Handle,
        /// Process that receives the deferred readiness reply.
        source: Endpoint,
        interest: SelectOps,
    },
    Control {
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        op: ControlOp,
    },
    Cancel {
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
    },
}

impl Request {
    /// Handle the request is addressed to, if any.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Open { .. } => None,
            Self::Close { handle, .. }
            | Self::Read { handle, .. }
            | Self::Write { handle, .. }
            | Self::Select { handle, .. }
            | Self::Control { handle, .. }
            | Self::Cancel { handle, .. } => Some(*handle),
        }
    }
}

/// Result payload of a completed read, write, or control call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Bytes read; empty on end-of-file.
    Data(Vec<u8>),
    /// Count of bytes accepted by a write.
    Written(usize),
    /// Reply to a control operation.
    Control(ControlReply),
}

/// An outbound reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Opened {
        endpoint: Endpoint,
        result: Result<Handle, UdsError>,
    },
    Closed {
        handle: Handle,
        endpoint: Endpoint,
        result: Result<(), UdsError>,
    },
    /// Completion of a read, write, control, or cancel request, either
    /// immediate or synthesized by a revive.
    Revive {
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        result: Result<Completion, UdsError>,
    },
    Select {
        handle: Handle,
        source: Endpoint,
        result: Result<SelectOps, UdsError>,
        /// Set for the asynchronous update that follows the initial snapshot.
        deferred: bool,
    },
}

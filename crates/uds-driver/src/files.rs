//! File handles passed as ancillary data.
//!
//! `sendmsg` with `SCM_RIGHTS` takes a reference to each listed file out of
//! the sender; `recvmsg` installs those references in the receiver. A
//! reference that is never received must be released when the holding
//! socket closes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::message::Endpoint;

/// Errors from the file broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error, miette::Diagnostic)]
pub enum FileBrokerError {
    /// The sender does not have the descriptor open.
    #[error("bad file descriptor {fd} in endpoint {endpoint}")]
    BadDescriptor { endpoint: i32, fd: i32 },

    /// The reference is unknown or was already consumed.
    #[error("unknown file reference: {file}")]
    UnknownReference { file: u64 },

    /// The receiver has no free descriptor slot.
    #[error("endpoint {endpoint} has too many open files")]
    TooManyFiles { endpoint: i32 },
}

/// An in-flight reference to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef(pub u64);

/// Moves file references between client processes.
pub trait FileBroker {
    /// Take a reference to `fd` in the sending process.
    fn copy_in(&mut self, from: Endpoint, fd: i32) -> Result<FileRef, FileBrokerError>;

    /// Install the reference in the receiving process, returning its new descriptor.
    fn copy_out(&mut self, to: Endpoint, file: FileRef) -> Result<i32, FileBrokerError>;

    /// Drop an undelivered reference.
    fn release(&mut self, file: FileRef) -> Result<(), FileBrokerError>;
}

/// Broker that tracks references in memory and numbers received
/// descriptors per endpoint.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    next_ref: u64,
    in_flight: HashMap<FileRef, (Endpoint, i32)>,
    next_fd: HashMap<Endpoint, i32>,
    max_fds: Option<i32>,
}

impl MemoryBroker {
    /// Lowest descriptor number handed to a receiver.
    pub const FIRST_FD: i32 = 3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to install more than `max` descriptors in any one receiver.
    pub fn with_max_fds(max: i32) -> Self {
        Self {
            max_fds: Some(max),
            ..Self::default()
        }
    }

    /// References taken but neither delivered nor released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Origin of an in-flight reference.
    pub fn origin(&self, file: FileRef) -> Option<(Endpoint, i32)> {
        self.in_flight.get(&file).copied()
    }
}

impl FileBroker for MemoryBroker {
    fn copy_in(&mut self, from: Endpoint, fd: i32) -> Result<FileRef, FileBrokerError> {
        if fd < 0 {
            return Err(FileBrokerError::BadDescriptor {
                endpoint: from.0,
                fd,
            });
        }
        self.next_ref += 1;
        let file = FileRef(self.next_ref);
        self.in_flight.insert(file, (from, fd));
        trace!(from = from.0, fd, file = file.0, "file reference taken");
        Ok(file)
    }

    fn copy_out(&mut self, to: Endpoint, file: FileRef) -> Result<i32, FileBrokerError> {
        let next = self.next_fd.entry(to).or_insert(Self::FIRST_FD);
        if self.max_fds.is_some_and(|max| *next >= Self::FIRST_FD + max) {
            return Err(FileBrokerError::TooManyFiles { endpoint: to.0 });
        }
        self.in_flight
            .remove(&file)
            .ok_or(FileBrokerError::UnknownReference { file: file.0 })?;
        let fd = *next;
        *next += 1;
        Ok(fd)
    }

    fn release(&mut self, file: FileRef) -> Result<(), FileBrokerError> {
        self.in_flight
            .remove(&file)
            .map(|_| ())
            .ok_or(FileBrokerError::UnknownReference { file: file.0 })
    }
}

//! Backing byte containers.
//!
//! Every open socket owns one container that holds the bytes written to it
//! by its peer. The driver only needs four synchronous primitives from the
//! storage backend, captured by [`ByteStore`]. [`MemoryStore`] keeps the
//! containers in process memory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

// ---------------------------------------------------------------------------
//  Errors
// ---------------------------------------------------------------------------

/// Errors reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error, miette::Diagnostic)]
pub enum StorageError {
    /// No room for another container.
    #[error("no space left for a new container")]
    NoSpace,

    /// The container does not exist.
    #[error("unknown container: {id}")]
    UnknownContainer { id: u64 },

    /// Read starting past the end of the container.
    #[error("read beyond end of container {id}: offset {offset}, length {len}")]
    OutOfRange { id: u64, offset: usize, len: usize },
}

// ---------------------------------------------------------------------------
//  Backend interface
// ---------------------------------------------------------------------------

/// Identifier of a byte container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "container:{}", self.0)
    }
}

/// Synchronous byte-container backend.
pub trait ByteStore {
    /// Create an empty container owned by `uid`/`gid`.
    fn create(&mut self, uid: u32, gid: u32) -> Result<ContainerId, StorageError>;

    /// Release a container.
    fn delete(&mut self, id: ContainerId) -> Result<(), StorageError>;

    /// Read up to `len` bytes starting at `offset`.
    fn read(&mut self, id: ContainerId, offset: usize, len: usize)
        -> Result<Vec<u8>, StorageError>;

    /// Write `data` at `offset`, returning the number of bytes stored.
    fn write(&mut self, id: ContainerId, offset: usize, data: &[u8])
        -> Result<usize, StorageError>;
}

// ---------------------------------------------------------------------------
//  In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Container {
    uid: u32,
    gid: u32,
    bytes: Vec<u8>,
}

/// Containers kept in a hash map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: HashMap<ContainerId, Container>,
    next_id: u64,
    max_containers: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses to hold more than `max` containers.
    pub fn with_max_containers(max: usize) -> Self {
        Self {
            max_containers: Some(max),
            ..Self::default()
        }
    }

    /// Number of live containers.
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    /// Whether no container is live.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Owner of a container.
    pub fn owner(&self, id: ContainerId) -> Option<(u32, u32)> {
        self.containers.get(&id).map(|c| (c.uid, c.gid))
    }

    /// Raw contents of a container.
    pub fn contents(&self, id: ContainerId) -> Option<&[u8]> {
        self.containers.get(&id).map(|c| c.bytes.as_slice())
    }

    fn container_mut(&mut self, id: ContainerId) -> Result<&mut Container, StorageError> {
        self.containers
            .get_mut(&id)
            .ok_or(StorageError::UnknownContainer { id: id.0 })
    }
}

impl ByteStore for MemoryStore {
    fn create(&mut self, uid: u32, gid: u32) -> Result<ContainerId, StorageError> {
        if self
            .max_containers
            .is_some_and(|max| self.containers.len() >= max)
        {
            return Err(StorageError::NoSpace);
        }
        self.next_id += 1;
        let id = ContainerId(self.next_id);
        self.containers.insert(
            id,
            Container {
                uid,
                gid,
                bytes: Vec::new(),
            },
        );
        trace!(%id, uid, gid, "container created");
        Ok(id)
    }

    fn delete(&mut self, id: ContainerId) -> Result<(), StorageError> {
        self.containers
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::UnknownContainer { id: id.0 })
    }

    fn read(
        &mut self,
        id: ContainerId,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, StorageError> {
        let container = self.container_mut(id)?;
        if offset > container.bytes.len() {
            return Err(StorageError::OutOfRange {
                id: id.0,
                offset,
                len,
            });
        }
        let end = std::cmp::min(offset + len, container.bytes.len());
        Ok(container.bytes[offset..end].to_vec())
    }

    fn write(
        &mut self,
        id: ContainerId,
        offset: usize,
        data: &[u8],
    ) -> Result<usize, StorageError> {
        let container = self.container_mut(id)?;
        let end = offset + data.len();
        if container.bytes.len() < end {
            container.bytes.resize(end, 0);
        }
        container.bytes[offset..end].copy_from_slice(data);
        Ok(data.len())
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

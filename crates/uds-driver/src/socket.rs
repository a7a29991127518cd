//! Socket vocabulary shared by every component.
//!
//! - Socket types (stream, datagram, sequential packet)
//! - `sockaddr_un` style addresses
//! - Read/write mode bits and shutdown directions
//! - select(2) operation sets

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
//  Socket Type
// ---------------------------------------------------------------------------

/// Socket type, set once by `socket(2)` through the set-type control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketType {
    /// SOCK_STREAM.
    Stream,
    /// SOCK_DGRAM.
    Datagram,
    /// SOCK_SEQPACKET.
    SeqPacket,
}

impl SocketType {
    /// Stream and sequential-packet sockets need a peer.
    pub fn is_connection_oriented(self) -> bool {
        matches!(self, Self::Stream | Self::SeqPacket)
    }
}

impl std::fmt::Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "SOCK_STREAM"),
            Self::Datagram => write!(f, "SOCK_DGRAM"),
            Self::SeqPacket => write!(f, "SOCK_SEQPACKET"),
        }
    }
}

// ---------------------------------------------------------------------------
//  Unix Address
// ---------------------------------------------------------------------------

/// Maximum length of a socket path (`sun_path`).
pub const UNIX_PATH_MAX: usize = 104;

/// A Unix-domain socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnixAddress {
    path: String,
}

impl UnixAddress {
    /// Create an address, truncating the path to [`UNIX_PATH_MAX`] bytes
    /// the way `strncmp` over `sun_path` would see it.
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if path.len() > UNIX_PATH_MAX {
            let mut end = UNIX_PATH_MAX;
            while !path.is_char_boundary(end) {
                end -= 1;
            }
            path.truncate(end);
        }
        Self { path }
    }

    /// Address given to both ends of a socketpair.
    pub fn unnamed_pair() -> Self {
        Self::new("X")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// An empty path cannot be bound.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

impl std::fmt::Display for UnixAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unix:{}", self.path)
    }
}

// ---------------------------------------------------------------------------
//  Mode
// ---------------------------------------------------------------------------

/// Directions still open on a socket. Only shutdown clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mode {
    pub readable: bool,
    pub writable: bool,
}

impl Mode {
    pub const READ_WRITE: Mode = Mode {
        readable: true,
        writable: true,
    };

    /// Clear the bits named by `how`.
    pub fn shut(&mut self, how: Shutdown) {
        match how {
            Shutdown::Read => self.readable = false,
            Shutdown::Write => self.writable = false,
            Shutdown::Both => *self = Mode::default(),
        }
    }
}

/// shutdown(2) direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shutdown {
    /// SHUT_RD.
    Read,
    /// SHUT_WR.
    Write,
    /// SHUT_RDWR.
    Both,
}

// ---------------------------------------------------------------------------
//  Select operations
// ---------------------------------------------------------------------------

/// select(2) operation set (SEL_RD / SEL_WR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectOps {
    /// A read would not block.
    pub read: bool,
    /// A write would not block.
    pub write: bool,
}

impl SelectOps {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn both() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    /// Check if any operation is set.
    pub fn any(&self) -> bool {
        self.read || self.write
    }

    /// Operations present in both sets.
    pub fn intersect(self, other: SelectOps) -> SelectOps {
        SelectOps {
            read: self.read && other.read,
            write: self.write && other.write,
        }
    }

    /// Operations in `self` but not in `other`.
    pub fn difference(self, other: SelectOps) -> SelectOps {
        SelectOps {
            read: self.read && !other.read,
            write: self.write && !other.write,
        }
    }

    pub fn insert(&mut self, other: SelectOps) {
        self.read |= other.read;
        self.write |= other.write;
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

#![forbid(unsafe_code)]
//! Unix-domain socket driver.
//!
//! This crate provides:
//!
//! - **Descriptor Table**: fixed arena of socket descriptors keyed by handle
//! - **Transfer Engine**: buffered stream, datagram and seqpacket I/O with a non-mutating probe
//! - **Rendezvous**: bind, listen, connect, accept, socketpair, shutdown
//! - **Suspend/Revive**: parked calls resumed by complementary events
//! - **Select**: readiness snapshots and deferred readiness updates
//! - **Cancellation**: rollback of interrupted accept and connect
//! - **Control Operations**: sockopts, peer credentials, sendto/recvfrom, ancillary file passing

pub mod cancel;
pub mod config;
pub mod connection;
pub mod control;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod files;
pub mod message;
pub mod revive;
pub mod select;
pub mod socket;
pub mod storage;
pub mod table;
pub mod transfer;

// Re-export key types from each module.

pub use config::{ConfigError, DriverConfig};
pub use control::{AncillaryIn, AncillaryOut, ControlCode, ControlOp, ControlReply};
pub use credentials::{CredentialError, CredentialResolver, Credentials, StaticCredentials};
pub use driver::{Driver, MemoryDriver};
pub use error::{Result, UdsError};
pub use files::{FileBroker, FileBrokerError, FileRef, MemoryBroker};
pub use message::{Completion, Endpoint, GrantId, Reply, Request};
pub use revive::Outcome;
pub use socket::{Mode, SelectOps, Shutdown, SocketType, UnixAddress, UNIX_PATH_MAX};
pub use storage::{ByteStore, ContainerId, MemoryStore, StorageError};
pub use table::{Descriptor, DescriptorTable, Handle, Pending};

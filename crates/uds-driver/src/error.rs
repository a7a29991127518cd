//! Driver error types.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::FileBrokerError;
use crate::storage::StorageError;

/// Errors returned to callers of the socket driver.
///
/// `Suspend` is not an error: an operation that has to wait returns
/// [`Outcome::Suspend`](crate::revive::Outcome) instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error, Diagnostic)]
pub enum UdsError {
    /// The handle does not name an open socket (EINVAL).
    #[error("invalid socket handle: {handle}")]
    #[diagnostic(code(uds::invalid_handle))]
    InvalidHandle { handle: u32 },

    /// Every descriptor slot is in use (ENFILE).
    #[error("descriptor table is full")]
    #[diagnostic(code(uds::too_many_open))]
    TooManyOpen,

    /// The socket or its peer was shut down in this direction (EPIPE).
    #[error("broken pipe")]
    #[diagnostic(code(uds::broken_pipe))]
    BrokenPipe,

    /// A connection-oriented socket has no peer (ENOTCONN).
    #[error("socket is not connected")]
    #[diagnostic(code(uds::not_connected))]
    NotConnected,

    /// The peer closed the connection (ECONNRESET).
    #[error("connection reset by peer")]
    #[diagnostic(code(uds::connection_reset))]
    ConnectionReset,

    /// No listener accepted the connection (ECONNREFUSED).
    #[error("connection refused")]
    #[diagnostic(code(uds::connection_refused))]
    ConnectionRefused,

    /// The message can never fit in a socket buffer (EMSGSIZE).
    #[error("message too large: {size} > max {max}")]
    #[diagnostic(code(uds::message_too_large))]
    MessageTooLarge { size: usize, max: usize },

    /// No socket is bound to the target address (ENOENT).
    #[error("no socket bound to the target address")]
    #[diagnostic(code(uds::no_such_target))]
    NoSuchTarget,

    /// The control code is not handled by this driver (EBADIOCTL).
    #[error("unsupported control operation: {code:#x}")]
    #[diagnostic(code(uds::unsupported_control_op))]
    UnsupportedControlOp { code: u32 },

    /// The in-flight call was cancelled (EINTR).
    #[error("operation interrupted")]
    #[diagnostic(code(uds::interrupted))]
    Interrupted,

    /// Invalid argument for the socket's current state (EINVAL).
    #[error("invalid argument: {detail}")]
    #[diagnostic(code(uds::invalid_argument))]
    InvalidArgument { detail: String },

    /// The socket already has a peer (EISCONN).
    #[error("socket is already connected")]
    #[diagnostic(code(uds::already_connected))]
    AlreadyConnected,

    /// Another socket is bound to the address (EADDRINUSE).
    #[error("address already in use: {path}")]
    #[diagnostic(code(uds::address_in_use))]
    AddressInUse { path: String },

    /// The operation is valid but not supported for this socket (EOPNOTSUPP / ENOSYS).
    #[error("operation not supported: {detail}")]
    #[diagnostic(code(uds::not_supported))]
    NotSupported { detail: String },

    /// Too many file handles queued as ancillary data (EOVERFLOW).
    #[error("too many ancillary file handles (max {max})")]
    #[diagnostic(code(uds::ancillary_overflow))]
    AncillaryOverflow { max: usize },

    /// The caller's endpoint could not be resolved to credentials (ESRCH).
    #[error("no such process: endpoint {endpoint}")]
    #[diagnostic(code(uds::no_such_process))]
    NoSuchProcess { endpoint: i32 },

    /// The byte-storage backend failed.
    #[error(transparent)]
    #[diagnostic(code(uds::storage))]
    Storage(#[from] StorageError),

    /// Moving a file handle between processes failed.
    #[error(transparent)]
    #[diagnostic(code(uds::file_transfer))]
    FileTransfer(#[from] FileBrokerError),
}

impl UdsError {
    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        Self::NotSupported {
            detail: detail.into(),
        }
    }
}

/// Driver result type alias.
pub type Result<T> = std::result::Result<T, UdsError>;

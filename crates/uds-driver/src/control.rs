//! Socket control operations (the ioctl family).
//!
//! Every socket call other than plain read and write reaches the driver as
//! a [`ControlOp`]: socket(2) sets the type, bind/listen/connect/accept and
//! friends map one-to-one, and getsockopt/setsockopt are split per option.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credentials::{CredentialResolver, Credentials};
use crate::driver::Driver;
use crate::error::{Result, UdsError};
use crate::files::FileBroker;
use crate::message::{Endpoint, GrantId};
use crate::revive::Outcome;
use crate::socket::{Shutdown, SocketType, UnixAddress};
use crate::storage::ByteStore;
use crate::table::{Call, Handle, PendingIo};

// ---------------------------------------------------------------------------
//  Operations
// ---------------------------------------------------------------------------

/// Ancillary data supplied to `sendmsg`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AncillaryIn {
    /// Sender's descriptors to pass (`SCM_RIGHTS`).
    #[serde(default)]
    pub fds: Vec<i32>,
    /// Attach the sender's credentials (`SCM_CREDENTIALS`).
    #[serde(default)]
    pub credentials: bool,
}

/// Ancillary data returned by `recvmsg`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AncillaryOut {
    /// Descriptors installed in the receiver.
    pub fds: Vec<i32>,
    pub credentials: Option<Credentials>,
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    SetType(SocketType),
    Bind(UnixAddress),
    GetSockName,
    GetPeerName,
    Listen(usize),
    Connect(UnixAddress),
    /// Issued on the fresh socket that becomes the server end; names the
    /// listener's address.
    Accept(UnixAddress),
    Shutdown(Shutdown),
    /// Link with another freshly opened socket.
    SocketPair(Handle),
    GetSendBuf,
    SetSendBuf(usize),
    GetRecvBuf,
    SetRecvBuf(usize),
    GetType,
    GetPeerCred,
    SendTo(UnixAddress),
    RecvFrom,
    SendMsg(AncillaryIn),
    RecvMsg,
    /// A control code this driver does not implement.
    Unknown(u32),
}

/// Payload-free identity of a [`ControlOp`], recorded for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    SetType,
    Bind,
    GetSockName,
    GetPeerName,
    Listen,
    Connect,
    Accept,
    Shutdown,
    SocketPair,
    GetSendBuf,
    SetSendBuf,
    GetRecvBuf,
    SetRecvBuf,
    GetType,
    GetPeerCred,
    SendTo,
    RecvFrom,
    SendMsg,
    RecvMsg,
    Unknown(u32),
}

impl ControlOp {
    pub fn code(&self) -> ControlCode {
        match self {
            Self::SetType(_) => ControlCode::SetType,
            Self::Bind(_) => ControlCode::Bind,
            Self::GetSockName => ControlCode::GetSockName,
            Self::GetPeerName => ControlCode::GetPeerName,
            Self::Listen(_) => ControlCode::Listen,
            Self::Connect(_) => ControlCode::Connect,
            Self::Accept(_) => ControlCode::Accept,
            Self::Shutdown(_) => ControlCode::Shutdown,
            Self::SocketPair(_) => ControlCode::SocketPair,
            Self::GetSendBuf => ControlCode::GetSendBuf,
            Self::SetSendBuf(_) => ControlCode::SetSendBuf,
            Self::GetRecvBuf => ControlCode::GetRecvBuf,
            Self::SetRecvBuf(_) => ControlCode::SetRecvBuf,
            Self::GetType => ControlCode::GetType,
            Self::GetPeerCred => ControlCode::GetPeerCred,
            Self::SendTo(_) => ControlCode::SendTo,
            Self::RecvFrom => ControlCode::RecvFrom,
            Self::SendMsg(_) => ControlCode::SendMsg,
            Self::RecvMsg => ControlCode::RecvMsg,
            Self::Unknown(code) => ControlCode::Unknown(*code),
        }
    }
}

/// Result of a completed control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    Done,
    Address(Option<UnixAddress>),
    SocketType(Option<SocketType>),
    BufferSize(usize),
    PeerCredentials(Credentials),
    Ancillary(AncillaryOut),
}

// ---------------------------------------------------------------------------
//  Dispatch
// ---------------------------------------------------------------------------

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    /// Run a control operation on behalf of `endpoint`.
    pub fn control(
        &mut self,
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        op: ControlOp,
    ) -> Result<Outcome<ControlReply>> {
        let desc = self.table.in_use_mut(handle)?;
        desc.owner = endpoint;
        desc.endpoint = endpoint;
        desc.select.selecting = false;
        desc.pending_io = PendingIo {
            grant,
            ..PendingIo::default()
        };
        desc.begin_call(Call::Control(op.code()));

        let outcome = self.run_control(handle, endpoint, op);
        if !matches!(outcome, Ok(Outcome::Suspend)) {
            if let Some(desc) = self.table.get_mut(handle) {
                desc.syscall_done = true;
            }
        }
        outcome
    }

    fn run_control(
        &mut self,
        handle: Handle,
        endpoint: Endpoint,
        op: ControlOp,
    ) -> Result<Outcome<ControlReply>> {
        let capacity = self.config.buffer_capacity;
        let reply = match op {
            ControlOp::SetType(t) => self.set_type(handle, t).map(|()| ControlReply::Done)?,
            ControlOp::Bind(addr) => self.bind(handle, addr).map(|()| ControlReply::Done)?,
            ControlOp::GetSockName => ControlReply::Address(self.table[handle].addr.clone()),
            ControlOp::GetPeerName => {
                let peer = self.connected_peer(handle)?;
                ControlReply::Address(self.table[peer].addr.clone())
            }
            ControlOp::Listen(backlog) => {
                self.listen(handle, backlog)?;
                ControlReply::Done
            }
            ControlOp::Connect(addr) => {
                return Ok(self.connect(handle, addr)?.map(|()| ControlReply::Done));
            }
            ControlOp::Accept(addr) => {
                return Ok(self.accept(handle, addr)?.map(|()| ControlReply::Done));
            }
            ControlOp::Shutdown(how) => {
                self.shutdown(handle, how)?;
                ControlReply::Done
            }
            ControlOp::SocketPair(other) => {
                self.socketpair(handle, other)?;
                ControlReply::Done
            }
            ControlOp::GetSendBuf | ControlOp::GetRecvBuf => ControlReply::BufferSize(capacity),
            ControlOp::SetSendBuf(size) | ControlOp::SetRecvBuf(size) => {
                if size > capacity {
                    return Err(UdsError::unsupported(format!(
                        "buffer size {size} exceeds {capacity}"
                    )));
                }
                ControlReply::Done
            }
            ControlOp::GetType => ControlReply::SocketType(self.table[handle].socket_type),
            ControlOp::GetPeerCred => {
                let peer = self.connected_peer(handle)?;
                let owner = self.table[peer].owner;
                let creds = self
                    .credentials
                    .resolve(owner)
                    .map_err(|_| UdsError::NoSuchProcess { endpoint: owner.0 })?;
                ControlReply::PeerCredentials(creds)
            }
            ControlOp::SendTo(addr) => {
                let desc = &mut self.table[handle];
                if desc.socket_type != Some(SocketType::Datagram) {
                    return Err(UdsError::invalid("sendto requires a datagram socket"));
                }
                desc.target = Some(addr);
                ControlReply::Done
            }
            ControlOp::RecvFrom => ControlReply::Address(self.table[handle].source.clone()),
            ControlOp::SendMsg(ancillary) => {
                self.send_ancillary(handle, endpoint, ancillary)?;
                ControlReply::Done
            }
            ControlOp::RecvMsg => ControlReply::Ancillary(self.recv_ancillary(handle, endpoint)?),
            ControlOp::Unknown(code) => {
                debug!(handle = handle.0, code, "unsupported control code");
                return Err(UdsError::UnsupportedControlOp { code });
            }
        };
        Ok(Outcome::Done(reply))
    }

    /// Peer of a connected socket, consuming a latched reset otherwise.
    fn connected_peer(&mut self, handle: Handle) -> Result<Handle> {
        let desc = self.table.in_use_mut(handle)?;
        let peer = desc.peer;
        peer.ok_or_else(|| desc.disconnected(true))
    }

    // -----------------------------------------------------------------------
    //  Ancillary data
    // -----------------------------------------------------------------------

    /// Queue file references and credentials on the receiving socket.
    fn send_ancillary(
        &mut self,
        handle: Handle,
        endpoint: Endpoint,
        ancillary: AncillaryIn,
    ) -> Result<()> {
        let peer = if self.table[handle].is_connection_oriented() {
            self.connected_peer(handle)?
        } else {
            self.table[handle]
                .target
                .clone()
                .and_then(|t| self.datagram_bound_to(&t))
                .ok_or(UdsError::NoSuchTarget)?
        };

        let max = self.config.max_ancillary_files;
        if self.table[peer].ancillary.files.len() + ancillary.fds.len() > max {
            return Err(UdsError::AncillaryOverflow { max });
        }
        let credentials = if ancillary.credentials {
            let creds = self
                .credentials
                .resolve(endpoint)
                .map_err(|_| UdsError::NoSuchProcess { endpoint: endpoint.0 })?;
            Some(creds)
        } else {
            None
        };

        let mut taken = Vec::with_capacity(ancillary.fds.len());
        for fd in ancillary.fds {
            match self.broker.copy_in(endpoint, fd) {
                Ok(file) => taken.push(file),
                Err(e) => {
                    for file in taken {
                        if let Err(release) = self.broker.release(file) {
                            warn!(file = file.0, error = %release, "failed to release file reference");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        debug!(handle = handle.0, peer = peer.0, files = taken.len(), "ancillary data queued");
        let dest = &mut self.table[peer].ancillary;
        dest.files.extend(taken);
        if credentials.is_some() {
            dest.credentials = credentials;
        }
        Ok(())
    }

    /// Deliver queued file references to `endpoint`.
    ///
    /// Once any descriptor has been installed the call succeeds with what
    /// was delivered; the rest stay queued for the next recvmsg.
    fn recv_ancillary(&mut self, handle: Handle, endpoint: Endpoint) -> Result<AncillaryOut> {
        let pending = std::mem::take(&mut self.table[handle].ancillary);
        let mut out = AncillaryOut {
            fds: Vec::with_capacity(pending.files.len()),
            credentials: pending.credentials,
        };
        for (i, file) in pending.files.iter().enumerate() {
            match self.broker.copy_out(endpoint, *file) {
                Ok(fd) => out.fds.push(fd),
                Err(e) => {
                    let queued = &mut self.table[handle].ancillary;
                    queued.files = pending.files[i..].to_vec();
                    if out.fds.is_empty() {
                        queued.credentials = out.credentials;
                        return Err(e.into());
                    }
                    warn!(
                        handle = handle.0,
                        delivered = out.fds.len(),
                        queued = queued.files.len(),
                        error = %e,
                        "partial ancillary delivery"
                    );
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::credentials::StaticCredentials;
    use crate::driver::MemoryDriver;
    use crate::files::{FileBrokerError, MemoryBroker};
    use crate::storage::MemoryStore;

    const GRANT: GrantId = GrantId(1);

    fn config() -> DriverConfig {
        DriverConfig {
            table_size: 8,
            buffer_capacity: 64,
            max_ancillary_files: 2,
            ..Default::default()
        }
    }

    fn ctl(drv: &mut MemoryDriver, h: Handle, op: ControlOp) -> Result<Outcome<ControlReply>> {
        drv.control(h, Endpoint(1), GRANT, op)
    }

    fn done(drv: &mut MemoryDriver, h: Handle, op: ControlOp) -> ControlReply {
        ctl(drv, h, op).unwrap().done().unwrap()
    }

    fn pair(drv: &mut MemoryDriver) -> (Handle, Handle) {
        let a = drv.open(Endpoint(1)).unwrap();
        let b = drv.open(Endpoint(2)).unwrap();
        done(drv, a, ControlOp::SocketPair(b));
        (a, b)
    }

    #[test]
    fn test_unknown_code() {
        let mut drv = MemoryDriver::in_memory(config());
        let h = drv.open(Endpoint(1)).unwrap();
        assert_eq!(
            ctl(&mut drv, h, ControlOp::Unknown(0x99)).unwrap_err(),
            UdsError::UnsupportedControlOp { code: 0x99 }
        );
        assert!(drv.table()[h].syscall_done);
    }

    #[test]
    fn test_invalid_handle() {
        let mut drv = MemoryDriver::in_memory(config());
        assert_eq!(
            ctl(&mut drv, Handle(5), ControlOp::GetType).unwrap_err(),
            UdsError::InvalidHandle { handle: 5 }
        );
    }

    #[test]
    fn test_type_and_names() {
        let mut drv = MemoryDriver::in_memory(config());
        let h = drv.open(Endpoint(1)).unwrap();
        assert_eq!(done(&mut drv, h, ControlOp::GetType), ControlReply::SocketType(None));
        done(&mut drv, h, ControlOp::SetType(SocketType::Stream));
        assert_eq!(
            done(&mut drv, h, ControlOp::GetType),
            ControlReply::SocketType(Some(SocketType::Stream))
        );
        done(&mut drv, h, ControlOp::Bind(UnixAddress::new("/s")));
        assert_eq!(
            done(&mut drv, h, ControlOp::GetSockName),
            ControlReply::Address(Some(UnixAddress::new("/s")))
        );
        assert_eq!(
            ctl(&mut drv, h, ControlOp::GetPeerName).unwrap_err(),
            UdsError::NotConnected
        );
    }

    #[test]
    fn test_peer_name_after_reset() {
        let mut drv = MemoryDriver::in_memory(config());
        let (a, b) = pair(&mut drv);
        drv.close(b).unwrap();
        assert_eq!(
            ctl(&mut drv, a, ControlOp::GetPeerName).unwrap_err(),
            UdsError::ConnectionReset
        );
        assert_eq!(
            ctl(&mut drv, a, ControlOp::GetPeerName).unwrap_err(),
            UdsError::NotConnected
        );
    }

    #[test]
    fn test_buffer_sizes() {
        let mut drv = MemoryDriver::in_memory(config());
        let h = drv.open(Endpoint(1)).unwrap();
        assert_eq!(done(&mut drv, h, ControlOp::GetSendBuf), ControlReply::BufferSize(64));
        assert_eq!(done(&mut drv, h, ControlOp::GetRecvBuf), ControlReply::BufferSize(64));
        assert_eq!(done(&mut drv, h, ControlOp::SetRecvBuf(32)), ControlReply::Done);
        assert!(matches!(
            ctl(&mut drv, h, ControlOp::SetSendBuf(65)),
            Err(UdsError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_peer_credentials() {
        let mut creds = StaticCredentials::new();
        let server = Credentials {
            pid: 20,
            uid: 1000,
            gid: 100,
        };
        creds.insert(Endpoint(1), Credentials::default());
        creds.insert(Endpoint(2), server);
        let mut drv = MemoryDriver::new(config(), MemoryStore::new(), creds, MemoryBroker::new());
        let (a, b) = pair(&mut drv);
        drv.control(b, Endpoint(2), GRANT, ControlOp::GetType).unwrap();
        assert_eq!(
            done(&mut drv, a, ControlOp::GetPeerCred),
            ControlReply::PeerCredentials(server)
        );
    }

    #[test]
    fn test_sendto_recvfrom() {
        let mut drv = MemoryDriver::in_memory(config());
        let s = drv.open(Endpoint(1)).unwrap();
        done(&mut drv, s, ControlOp::SetType(SocketType::Stream));
        assert!(matches!(
            ctl(&mut drv, s, ControlOp::SendTo(UnixAddress::new("/x"))),
            Err(UdsError::InvalidArgument { .. })
        ));

        let d = drv.open(Endpoint(1)).unwrap();
        done(&mut drv, d, ControlOp::SetType(SocketType::Datagram));
        done(&mut drv, d, ControlOp::SendTo(UnixAddress::new("/x")));
        assert_eq!(drv.table()[d].target, Some(UnixAddress::new("/x")));
        assert_eq!(done(&mut drv, d, ControlOp::RecvFrom), ControlReply::Address(None));
    }

    #[test]
    fn test_sendmsg_recvmsg() {
        let mut drv = MemoryDriver::in_memory(config());
        let (a, b) = pair(&mut drv);
        done(
            &mut drv,
            a,
            ControlOp::SendMsg(AncillaryIn {
                fds: vec![5, 6],
                credentials: true,
            }),
        );
        assert_eq!(drv.table()[b].ancillary.files.len(), 2);
        assert_eq!(drv.broker().in_flight(), 2);

        let reply = drv.control(b, Endpoint(2), GRANT, ControlOp::RecvMsg).unwrap();
        let Outcome::Done(ControlReply::Ancillary(out)) = reply else {
            panic!("expected an ancillary reply");
        };
        assert_eq!(out.fds, vec![MemoryBroker::FIRST_FD, MemoryBroker::FIRST_FD + 1]);
        assert_eq!(out.credentials.map(|c| c.pid), Some(1));
        assert_eq!(drv.broker().in_flight(), 0);
        assert!(drv.table()[b].ancillary.files.is_empty());
    }

    #[test]
    fn test_sendmsg_overflow() {
        let mut drv = MemoryDriver::in_memory(config());
        let (a, _) = pair(&mut drv);
        assert_eq!(
            ctl(
                &mut drv,
                a,
                ControlOp::SendMsg(AncillaryIn {
                    fds: vec![3, 4, 5],
                    credentials: false,
                })
            )
            .unwrap_err(),
            UdsError::AncillaryOverflow { max: 2 }
        );
        assert_eq!(drv.broker().in_flight(), 0);
    }

    #[test]
    fn test_sendmsg_bad_descriptor_releases_taken() {
        let mut drv = MemoryDriver::in_memory(config());
        let (a, b) = pair(&mut drv);
        let err = ctl(
            &mut drv,
            a,
            ControlOp::SendMsg(AncillaryIn {
                fds: vec![4, -1],
                credentials: false,
            }),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UdsError::FileTransfer(FileBrokerError::BadDescriptor { fd: -1, .. })
        ));
        assert_eq!(drv.broker().in_flight(), 0);
        assert!(drv.table()[b].ancillary.files.is_empty());
    }

    #[test]
    fn test_recvmsg_failure_keeps_undelivered() {
        let mut drv = MemoryDriver::new(
            config(),
            MemoryStore::new(),
            StaticCredentials::with_fallback(0, 0),
            MemoryBroker::with_max_fds(1),
        );
        let (a, b) = pair(&mut drv);
        done(
            &mut drv,
            a,
            ControlOp::SendMsg(AncillaryIn {
                fds: vec![7, 8],
                credentials: false,
            }),
        );
        // The first descriptor fits and is reported; the second stays queued.
        assert_eq!(
            drv.control(b, Endpoint(2), GRANT, ControlOp::RecvMsg)
                .unwrap()
                .done()
                .unwrap(),
            ControlReply::Ancillary(AncillaryOut {
                fds: vec![MemoryBroker::FIRST_FD],
                credentials: None,
            })
        );
        assert_eq!(drv.table()[b].ancillary.files.len(), 1);
        assert_eq!(drv.broker().in_flight(), 1);

        // Nothing can be installed now: the call fails and keeps the queue.
        let err = drv.control(b, Endpoint(2), GRANT, ControlOp::RecvMsg).unwrap_err();
        assert!(matches!(err, UdsError::FileTransfer(FileBrokerError::TooManyFiles { .. })));
        assert_eq!(drv.table()[b].ancillary.files.len(), 1);
        assert_eq!(drv.broker().in_flight(), 1);
    }

    #[test]
    fn test_recvmsg_failure_keeps_credentials() {
        let mut drv = MemoryDriver::new(
            config(),
            MemoryStore::new(),
            StaticCredentials::with_fallback(0, 0),
            MemoryBroker::with_max_fds(0),
        );
        let (a, b) = pair(&mut drv);
        done(
            &mut drv,
            a,
            ControlOp::SendMsg(AncillaryIn {
                fds: vec![7],
                credentials: true,
            }),
        );
        assert!(drv.control(b, Endpoint(2), GRANT, ControlOp::RecvMsg).is_err());
        assert_eq!(drv.table()[b].ancillary.files.len(), 1);
        assert_eq!(drv.table()[b].ancillary.credentials.as_ref().map(|c| c.pid), Some(1));
    }
}

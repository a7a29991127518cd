//! Connection and rendezvous management.
//!
//! Provides:
//! - socket type assignment and address binding
//! - listen / connect / accept with a FIFO backlog per listener
//! - socketpair linking
//! - shutdown
//! - address lookup for datagram delivery
//!
//! A connector that finds no acceptor waiting is queued on the listener's
//! backlog and suspends until an accept links it. An acceptor that finds an
//! empty backlog records itself as the listener's `child` and suspends; the
//! next connector links with it directly.

use tracing::debug;

use crate::credentials::CredentialResolver;
use crate::driver::Driver;
use crate::error::{Result, UdsError};
use crate::files::FileBroker;
use crate::revive::Outcome;
use crate::socket::{Shutdown, SocketType, UnixAddress};
use crate::storage::ByteStore;
use crate::table::{Handle, Pending};

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    // -----------------------------------------------------------------------
    //  Lookup
    // -----------------------------------------------------------------------

    /// First datagram socket bound to `addr`.
    pub(crate) fn datagram_bound_to(&self, addr: &UnixAddress) -> Option<Handle> {
        self.table
            .iter()
            .find(|(_, d)| {
                d.socket_type == Some(SocketType::Datagram) && d.addr.as_ref() == Some(addr)
            })
            .map(|(h, _)| h)
    }

    /// Listening sockets bound to `addr`, optionally of one type, in slot order.
    fn listeners_at(&self, addr: &UnixAddress, socket_type: Option<SocketType>) -> Vec<Handle> {
        self.table
            .iter()
            .filter(|(_, d)| d.listening && d.addr.as_ref() == Some(addr))
            .filter(|(_, d)| socket_type.map_or(true, |t| d.socket_type == Some(t)))
            .map(|(h, _)| h)
            .collect()
    }

    // -----------------------------------------------------------------------
    //  Setup
    // -----------------------------------------------------------------------

    /// Assign the socket type. Only allowed once.
    pub fn set_type(&mut self, handle: Handle, socket_type: SocketType) -> Result<()> {
        let desc = self.table.in_use_mut(handle)?;
        if let Some(current) = desc.socket_type {
            return Err(UdsError::invalid(format!("socket type already set to {current}")));
        }
        desc.socket_type = Some(socket_type);
        Ok(())
    }

    /// Bind the socket to `addr`.
    pub fn bind(&mut self, handle: Handle, addr: UnixAddress) -> Result<()> {
        let desc = self.table.in_use(handle)?;
        let socket_type = desc
            .socket_type
            .ok_or_else(|| UdsError::invalid("bind on a socket without a type"))?;
        if socket_type != SocketType::Datagram && desc.addr.is_some() {
            return Err(UdsError::invalid("socket is already bound"));
        }
        if addr.is_empty() {
            return Err(UdsError::NoSuchTarget);
        }
        if self.table.iter().any(|(_, d)| d.addr.as_ref() == Some(&addr)) {
            return Err(UdsError::AddressInUse {
                path: addr.path().to_string(),
            });
        }
        debug!(handle = handle.0, %addr, "bound");
        self.table[handle].addr = Some(addr);
        Ok(())
    }

    /// Mark the socket as accepting connections with room for `backlog`
    /// pending connectors. A repeated listen can only grow the backlog.
    pub fn listen(&mut self, handle: Handle, backlog: usize) -> Result<()> {
        let max = self.config.max_backlog;
        let desc = self.table.in_use_mut(handle)?;
        let socket_type = desc
            .socket_type
            .ok_or_else(|| UdsError::invalid("listen on a socket without a type"))?;
        if desc.addr.is_none() {
            return Err(UdsError::invalid("listen on an unbound socket"));
        }
        if !socket_type.is_connection_oriented() {
            return Err(UdsError::unsupported(format!("listen on {socket_type}")));
        }
        if desc.peer.is_some() {
            return Err(UdsError::invalid("listen on a connected socket"));
        }

        let requested = backlog.min(max);
        if !desc.listening || requested > desc.backlog_size {
            desc.backlog_size = requested;
        }
        desc.listening = true;
        debug!(handle = handle.0, backlog = desc.backlog_size, "listening");
        Ok(())
    }

    // -----------------------------------------------------------------------
    //  Rendezvous
    // -----------------------------------------------------------------------

    /// Connect to the listener bound to `target`.
    ///
    /// Links immediately with an acceptor already waiting; otherwise queues
    /// on the first listener with backlog room and suspends.
    pub fn connect(&mut self, handle: Handle, target: UnixAddress) -> Result<Outcome<()>> {
        let desc = self.table.in_use(handle)?;
        let socket_type = desc
            .socket_type
            .filter(|t| t.is_connection_oriented())
            .ok_or_else(|| UdsError::invalid("connect requires a stream or seqpacket socket"))?;
        if desc.peer.is_some() {
            return Err(UdsError::AlreadyConnected);
        }

        for listener in self.listeners_at(&target, Some(socket_type)) {
            if listener == handle {
                continue;
            }
            let child = self.table[listener]
                .child
                .filter(|&c| self.table.is_in_use(c));
            if let Some(child) = child {
                self.table[listener].child = None;
                self.table.link(handle, child, Some(target.clone()));
                self.wake(child);
                debug!(handle = handle.0, peer = child.0, %target, "connected to waiting acceptor");
                return Ok(Outcome::Done(()));
            }

            let server = &mut self.table[listener];
            if server.backlog.len() < server.backlog_size {
                server.backlog.push_back(handle);
                let desc = &mut self.table[handle];
                desc.addr = Some(target);
                desc.suspended = Pending::Connect;
                self.notify_readable(listener);
                debug!(handle = handle.0, listener = listener.0, "connect queued");
                return Ok(Outcome::Suspend);
            }
        }
        debug!(handle = handle.0, %target, "connection refused");
        Err(UdsError::ConnectionRefused)
    }

    /// Accept the oldest pending connection on the listener bound to
    /// `listener_addr`, making `handle` the server end.
    pub fn accept(&mut self, handle: Handle, listener_addr: UnixAddress) -> Result<Outcome<()>> {
        self.table.in_use(handle)?;
        let listener = self
            .listeners_at(&listener_addr, None)
            .into_iter()
            .find(|&l| l != handle)
            .ok_or_else(|| UdsError::invalid(format!("no listener bound to {listener_addr}")))?;

        let socket_type = self.table[listener].socket_type;
        self.table[listener].child = Some(handle);
        self.table[handle].socket_type = socket_type;

        let connector = loop {
            match self.table[listener].backlog.pop_front() {
                Some(c) if self.table.is_in_use(c) => break Some(c),
                Some(_) => continue,
                None => break None,
            }
        };
        let Some(connector) = connector else {
            self.table[handle].suspended = Pending::Accept;
            debug!(handle = handle.0, listener = listener.0, "accept suspended");
            return Ok(Outcome::Suspend);
        };

        let addr = self.table[listener].addr.clone();
        self.table.link(handle, connector, addr);
        self.table[listener].child = None;
        self.wake(connector);
        debug!(handle = handle.0, peer = connector.0, "accepted");
        Ok(Outcome::Done(()))
    }

    /// Link two freshly opened sockets. Unset types default to stream.
    pub fn socketpair(&mut self, handle: Handle, other: Handle) -> Result<()> {
        if handle == other {
            return Err(UdsError::invalid("socketpair with itself"));
        }
        let a = self.table.in_use(handle)?;
        let b = self.table.in_use(other)?;
        if a.peer.is_some() || b.peer.is_some() {
            return Err(UdsError::AlreadyConnected);
        }
        let type_a = a.socket_type.unwrap_or(SocketType::Stream);
        let type_b = b.socket_type.unwrap_or(SocketType::Stream);
        if type_a != type_b || !type_a.is_connection_oriented() {
            return Err(UdsError::invalid(format!(
                "socketpair of {type_a} and {type_b}"
            )));
        }
        self.table[handle].socket_type = Some(type_a);
        self.table[other].socket_type = Some(type_b);
        self.table.link(handle, other, Some(UnixAddress::unnamed_pair()));
        debug!(handle = handle.0, peer = other.0, "socketpair linked");
        Ok(())
    }

    /// Close one or both directions of a connected socket.
    pub fn shutdown(&mut self, handle: Handle, how: Shutdown) -> Result<()> {
        let desc = self.table.in_use_mut(handle)?;
        if !desc.is_connection_oriented() {
            return Err(UdsError::invalid("shutdown requires a connected socket"));
        }
        let linked = desc.peer;
        let Some(peer) = linked else {
            return Err(desc.disconnected(true));
        };
        desc.mode.shut(how);
        debug!(handle = handle.0, ?how, "shutdown");

        // A reader blocked on the peer now sees end-of-file.
        self.wake(peer);
        if how != Shutdown::Read {
            self.notify_readable(peer);
        }
        Ok(())
    }
}

// ===========================================================================
//  Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::driver::MemoryDriver;
    use crate::message::Endpoint;

    fn driver() -> MemoryDriver {
        MemoryDriver::in_memory(DriverConfig {
            table_size: 10,
            buffer_capacity: 32,
            max_backlog: 4,
            ..Default::default()
        })
    }

    fn socket(drv: &mut MemoryDriver, socket_type: SocketType) -> Handle {
        let h = drv.open(Endpoint(1)).unwrap();
        drv.set_type(h, socket_type).unwrap();
        h
    }

    fn listener(drv: &mut MemoryDriver, path: &str, backlog: usize) -> Handle {
        let h = socket(drv, SocketType::Stream);
        drv.bind(h, UnixAddress::new(path)).unwrap();
        drv.listen(h, backlog).unwrap();
        h
    }

    #[test]
    fn test_set_type_once() {
        let mut drv = driver();
        let h = socket(&mut drv, SocketType::Stream);
        assert!(matches!(
            drv.set_type(h, SocketType::Datagram),
            Err(UdsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_bind_rules() {
        let mut drv = driver();
        let untyped = drv.open(Endpoint(1)).unwrap();
        assert!(drv.bind(untyped, UnixAddress::new("/a")).is_err());

        let s = socket(&mut drv, SocketType::Stream);
        assert_eq!(drv.bind(s, UnixAddress::new("")).unwrap_err(), UdsError::NoSuchTarget);
        drv.bind(s, UnixAddress::new("/a")).unwrap();
        assert!(matches!(
            drv.bind(s, UnixAddress::new("/b")),
            Err(UdsError::InvalidArgument { .. })
        ));

        let d = socket(&mut drv, SocketType::Datagram);
        assert_eq!(
            drv.bind(d, UnixAddress::new("/a")).unwrap_err(),
            UdsError::AddressInUse { path: "/a".into() }
        );
        drv.bind(d, UnixAddress::new("/d1")).unwrap();
        drv.bind(d, UnixAddress::new("/d2")).unwrap();
        assert_eq!(drv.table()[d].addr, Some(UnixAddress::new("/d2")));
    }

    #[test]
    fn test_listen_rules() {
        let mut drv = driver();
        let s = socket(&mut drv, SocketType::Stream);
        assert!(matches!(drv.listen(s, 1), Err(UdsError::InvalidArgument { .. })));

        let d = socket(&mut drv, SocketType::Datagram);
        drv.bind(d, UnixAddress::new("/dg")).unwrap();
        assert!(matches!(drv.listen(d, 1), Err(UdsError::NotSupported { .. })));
    }

    #[test]
    fn test_listen_backlog_only_grows() {
        let mut drv = driver();
        let l = listener(&mut drv, "/srv", 2);
        assert_eq!(drv.table()[l].backlog_size, 2);
        drv.listen(l, 1).unwrap();
        assert_eq!(drv.table()[l].backlog_size, 2);
        drv.listen(l, 100).unwrap();
        assert_eq!(drv.table()[l].backlog_size, 4);
    }

    #[test]
    fn test_connect_queues_then_accept_links() {
        let mut drv = driver();
        let l = listener(&mut drv, "/srv", 2);
        let c = socket(&mut drv, SocketType::Stream);
        assert_eq!(drv.connect(c, UnixAddress::new("/srv")).unwrap(), Outcome::Suspend);
        assert_eq!(drv.table()[c].suspended, Pending::Connect);
        assert_eq!(drv.table()[l].backlog.len(), 1);

        let server = drv.open(Endpoint(2)).unwrap();
        assert_eq!(drv.accept(server, UnixAddress::new("/srv")).unwrap(), Outcome::Done(()));
        assert_eq!(drv.table()[server].peer, Some(c));
        assert_eq!(drv.table()[c].peer, Some(server));
        assert_eq!(drv.table()[server].socket_type, Some(SocketType::Stream));
        assert_eq!(drv.table()[l].child, None);
        assert!(drv.table()[c].ready_to_revive);
    }

    #[test]
    fn test_waiting_acceptor_links_directly() {
        let mut drv = driver();
        let l = listener(&mut drv, "/srv", 2);
        let server = drv.open(Endpoint(2)).unwrap();
        assert_eq!(drv.accept(server, UnixAddress::new("/srv")).unwrap(), Outcome::Suspend);
        assert_eq!(drv.table()[l].child, Some(server));

        let c = socket(&mut drv, SocketType::Stream);
        assert_eq!(drv.connect(c, UnixAddress::new("/srv")).unwrap(), Outcome::Done(()));
        assert_eq!(drv.table()[c].peer, Some(server));
        assert_eq!(drv.table()[l].child, None);
        assert!(drv.table()[server].ready_to_revive);
    }

    #[test]
    fn test_connect_refused_when_backlog_full() {
        let mut drv = driver();
        listener(&mut drv, "/srv", 1);
        let first = socket(&mut drv, SocketType::Stream);
        let second = socket(&mut drv, SocketType::Stream);
        assert!(drv.connect(first, UnixAddress::new("/srv")).unwrap().is_suspend());
        assert_eq!(
            drv.connect(second, UnixAddress::new("/srv")).unwrap_err(),
            UdsError::ConnectionRefused
        );
        assert_eq!(drv.table()[second].addr, None);
    }

    #[test]
    fn test_connect_type_must_match() {
        let mut drv = driver();
        listener(&mut drv, "/srv", 1);
        let c = socket(&mut drv, SocketType::SeqPacket);
        assert_eq!(
            drv.connect(c, UnixAddress::new("/srv")).unwrap_err(),
            UdsError::ConnectionRefused
        );
        let d = socket(&mut drv, SocketType::Datagram);
        assert!(matches!(
            drv.connect(d, UnixAddress::new("/srv")),
            Err(UdsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_accept_is_fifo() {
        let mut drv = driver();
        listener(&mut drv, "/srv", 3);
        let c1 = socket(&mut drv, SocketType::Stream);
        let c2 = socket(&mut drv, SocketType::Stream);
        drv.connect(c1, UnixAddress::new("/srv")).unwrap();
        drv.connect(c2, UnixAddress::new("/srv")).unwrap();

        let s1 = drv.open(Endpoint(2)).unwrap();
        drv.accept(s1, UnixAddress::new("/srv")).unwrap();
        let s2 = drv.open(Endpoint(2)).unwrap();
        drv.accept(s2, UnixAddress::new("/srv")).unwrap();
        assert_eq!(drv.table()[s1].peer, Some(c1));
        assert_eq!(drv.table()[s2].peer, Some(c2));
    }

    #[test]
    fn test_accept_without_listener() {
        let mut drv = driver();
        let s = drv.open(Endpoint(2)).unwrap();
        assert!(matches!(
            drv.accept(s, UnixAddress::new("/none")),
            Err(UdsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_already_connected() {
        let mut drv = driver();
        let a = drv.open(Endpoint(1)).unwrap();
        let b = drv.open(Endpoint(1)).unwrap();
        drv.socketpair(a, b).unwrap();
        listener(&mut drv, "/srv", 1);
        assert_eq!(
            drv.connect(a, UnixAddress::new("/srv")).unwrap_err(),
            UdsError::AlreadyConnected
        );
    }

    #[test]
    fn test_socketpair() {
        let mut drv = driver();
        let a = drv.open(Endpoint(1)).unwrap();
        let b = drv.open(Endpoint(1)).unwrap();
        drv.socketpair(a, b).unwrap();
        assert_eq!(drv.table()[a].socket_type, Some(SocketType::Stream));
        assert_eq!(drv.table()[b].peer, Some(a));
        assert_eq!(drv.table()[a].addr, Some(UnixAddress::unnamed_pair()));
        assert!(matches!(drv.socketpair(a, a), Err(UdsError::InvalidArgument { .. })));

        let d1 = socket(&mut drv, SocketType::Datagram);
        let d2 = socket(&mut drv, SocketType::Datagram);
        assert!(matches!(drv.socketpair(d1, d2), Err(UdsError::InvalidArgument { .. })));
    }

    #[test]
    fn test_shutdown() {
        let mut drv = driver();
        let lone = socket(&mut drv, SocketType::Stream);
        assert_eq!(drv.shutdown(lone, Shutdown::Both).unwrap_err(), UdsError::NotConnected);

        let a = drv.open(Endpoint(1)).unwrap();
        let b = drv.open(Endpoint(1)).unwrap();
        drv.socketpair(a, b).unwrap();
        drv.shutdown(a, Shutdown::Write).unwrap();
        assert!(drv.table()[a].mode.readable);
        assert!(!drv.table()[a].mode.writable);
    }

    #[test]
    fn test_datagram_lookup() {
        let mut drv = driver();
        let d = socket(&mut drv, SocketType::Datagram);
        drv.bind(d, UnixAddress::new("/dg")).unwrap();
        assert_eq!(drv.datagram_bound_to(&UnixAddress::new("/dg")), Some(d));
        assert_eq!(drv.datagram_bound_to(&UnixAddress::new("/other")), None);
    }
}

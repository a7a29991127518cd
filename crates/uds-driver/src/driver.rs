//! Request dispatcher and descriptor lifecycle.
//!
//! [`Driver`] owns the descriptor table and the three collaborators. It is
//! driven by one dispatch loop: each [`Driver::dispatch`] call handles a
//! single request, then drains the wake queue so every reply made possible
//! by that request is returned in the same turn.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::credentials::{CredentialResolver, StaticCredentials};
use crate::error::{Result, UdsError};
use crate::files::{FileBroker, MemoryBroker};
use crate::message::{Completion, Endpoint, GrantId, Reply, Request};
use crate::revive::Outcome;
use crate::storage::{ByteStore, MemoryStore};
use crate::table::{Call, Descriptor, DescriptorTable, Handle, PendingIo};

/// The socket driver.
#[derive(Debug)]
pub struct Driver<S, C, F> {
    pub(crate) config: DriverConfig,
    pub(crate) table: DescriptorTable,
    pub(crate) store: S,
    pub(crate) credentials: C,
    pub(crate) broker: F,
    /// Descriptors with a pending revive or select update.
    pub(crate) wake_queue: VecDeque<Handle>,
}

/// Driver over the in-memory collaborators.
pub type MemoryDriver = Driver<MemoryStore, StaticCredentials, MemoryBroker>;

impl MemoryDriver {
    /// In-memory driver that resolves every endpoint to uid/gid 0.
    pub fn in_memory(config: DriverConfig) -> Self {
        Self::new(
            config,
            MemoryStore::new(),
            StaticCredentials::with_fallback(0, 0),
            MemoryBroker::new(),
        )
    }
}

impl<S: ByteStore, C: CredentialResolver, F: FileBroker> Driver<S, C, F> {
    pub fn new(config: DriverConfig, store: S, credentials: C, broker: F) -> Self {
        let table = DescriptorTable::new(config.table_size);
        info!(
            slots = config.table_size,
            buffer = config.buffer_capacity,
            "socket driver initialized"
        );
        Self {
            config,
            table,
            store,
            credentials,
            broker,
            wake_queue: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn broker(&self) -> &F {
        &self.broker
    }

    pub fn credentials_mut(&mut self) -> &mut C {
        &mut self.credentials
    }

    // -----------------------------------------------------------------------
    //  Dispatch
    // -----------------------------------------------------------------------

    /// Handle one request. Returns its reply, if it did not suspend,
    /// followed by any replies for descriptors it woke.
    pub fn dispatch(&mut self, request: Request) -> Vec<Reply> {
        debug!(?request, "dispatch");
        let mut replies = Vec::new();
        let primary = match request {
            Request::Open { endpoint } => Some(Reply::Opened {
                endpoint,
                result: self.open(endpoint),
            }),
            Request::Close { handle, endpoint } => Some(Reply::Closed {
                handle,
                endpoint,
                result: self.close(handle),
            }),
            Request::Read {
                handle,
                endpoint,
                grant,
                size,
            } => {
                let result = self.read(handle, endpoint, grant, size);
                completion(handle, endpoint, grant, result, Completion::Data)
            }
            Request::Write {
                handle,
                endpoint,
                grant,
                data,
            } => {
                let result = self.write(handle, endpoint, grant, data);
                completion(handle, endpoint, grant, result, Completion::Written)
            }
            Request::Select {
                handle,
                source,
                interest,
            } => Some(Reply::Select {
                handle,
                source,
                result: self.select(handle, source, interest),
                deferred: false,
            }),
            Request::Control {
                handle,
                endpoint,
                grant,
                op,
            } => {
                let result = self.control(handle, endpoint, grant, op);
                completion(handle, endpoint, grant, result, Completion::Control)
            }
            Request::Cancel {
                handle,
                endpoint,
                grant,
            } => self.cancel(handle, endpoint).done().map(|err| Reply::Revive {
                handle,
                endpoint,
                grant,
                result: Err(err),
            }),
        };
        replies.extend(primary);
        replies.extend(self.drain_wakeups());
        replies
    }

    // -----------------------------------------------------------------------
    //  Lifecycle
    // -----------------------------------------------------------------------

    /// Allocate a socket for `endpoint`.
    pub fn open(&mut self, endpoint: Endpoint) -> Result<Handle> {
        let handle = self.table.find_free()?;
        self.table[handle] = Descriptor::opened(endpoint, self.config.max_backlog);

        let creds = match self.credentials.resolve(endpoint) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(endpoint = endpoint.0, error = %e, "credential lookup failed");
                self.table.reset(handle);
                return Err(UdsError::NoSuchProcess {
                    endpoint: endpoint.0,
                });
            }
        };
        let container = match self.store.create(creds.uid, creds.gid) {
            Ok(id) => id,
            Err(e) => {
                warn!(endpoint = endpoint.0, error = %e, "cannot create socket buffer");
                self.table.reset(handle);
                return Err(e.into());
            }
        };

        let desc = &mut self.table[handle];
        desc.container = container;
        desc.syscall_done = true;
        debug!(handle = handle.0, endpoint = endpoint.0, %container, "socket opened");
        Ok(handle)
    }

    /// Release a socket, resetting its peer and refusing queued connectors.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let desc = self.table.in_use_mut(handle)?;
        let peer = desc.peer;
        let container = desc.container;
        let connectors: Vec<Handle> = desc.backlog.drain(..).collect();
        let files = std::mem::take(&mut desc.ancillary.files);

        if let Some(peer) = peer.filter(|&p| self.table.is_in_use(p)) {
            let other = &mut self.table[peer];
            other.peer = None;
            other.err = Some(UdsError::ConnectionReset);
            self.wake(peer);
            self.notify_readable(peer);
        }
        for connector in connectors {
            if self.table.is_in_use(connector) {
                self.table[connector].err = Some(UdsError::ConnectionRefused);
                self.wake(connector);
            }
        }
        for file in files {
            if let Err(e) = self.broker.release(file) {
                warn!(handle = handle.0, file = file.0, error = %e, "failed to release file reference");
            }
        }

        self.table.forget(handle);
        self.table.reset(handle);
        self.wake_queue.retain(|&h| h != handle);

        self.store.delete(container).map_err(|e| {
            warn!(handle = handle.0, %container, error = %e, "cannot delete socket buffer");
            UdsError::from(e)
        })?;
        debug!(handle = handle.0, "socket closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    //  Read / write
    // -----------------------------------------------------------------------

    fn begin_transfer(
        &mut self,
        handle: Handle,
        endpoint: Endpoint,
        call: Call,
        pending_io: PendingIo,
    ) -> Result<()> {
        let desc = self.table.in_use_mut(handle)?;
        desc.endpoint = endpoint;
        desc.select.selecting = false;
        desc.begin_call(call);
        desc.pending_io = pending_io;
        Ok(())
    }

    fn finish_call<T>(&mut self, handle: Handle, result: &Result<Outcome<T>>) {
        if !matches!(result, Ok(Outcome::Suspend)) {
            if let Some(desc) = self.table.get_mut(handle) {
                desc.syscall_done = true;
                desc.pending_io.data.clear();
            }
        }
    }

    /// Read up to `size` bytes.
    pub fn read(
        &mut self,
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        size: usize,
    ) -> Result<Outcome<Vec<u8>>> {
        let pending = PendingIo {
            grant,
            size,
            data: Vec::new(),
        };
        self.begin_transfer(handle, endpoint, Call::Read, pending)?;
        let result = self.perform_read(handle, size);
        self.finish_call(handle, &result);
        result
    }

    /// Write `data` to the peer. A suspended write keeps its payload until
    /// it is retried.
    pub fn write(
        &mut self,
        handle: Handle,
        endpoint: Endpoint,
        grant: GrantId,
        data: Vec<u8>,
    ) -> Result<Outcome<usize>> {
        let pending = PendingIo {
            grant,
            size: data.len(),
            data,
        };
        self.begin_transfer(handle, endpoint, Call::Write, pending)?;
        let data = std::mem::take(&mut self.table[handle].pending_io.data);
        let result = self.perform_write(handle, &data);
        self.table[handle].pending_io.data = data;
        self.finish_call(handle, &result);
        result
    }
}

/// Reply for a read, write, or control result; none if it suspended.
fn completion<T>(
    handle: Handle,
    endpoint: Endpoint,
    grant: GrantId,
    result: Result<Outcome<T>>,
    wrap: impl FnOnce(T) -> Completion,
) -> Option<Reply> {
    let result = match result {
        Ok(Outcome::Suspend) => return None,
        Ok(Outcome::Done(value)) => Ok(wrap(value)),
        Err(e) => Err(e),
    };
    Some(Reply::Revive {
        handle,
        endpoint,
        grant,
        result,
    })
}

// ===========================================================================
//  Tests
// ===========================================================================

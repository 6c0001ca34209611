use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::config::TransportKind;
use crate::error::{Error, Result};
use crate::protocol::{Notification, Request, RequestId, Response};

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Moves protocol messages between this process and one server.
///
/// Implementations never surface channel failures from [`Transport::send`] as
/// errors: a dead process, a reset connection, an unparsable reply or a
/// timeout all come back as an error [`Response`] built with
/// [`Response::from_error`], so callers deal with a single error taxonomy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Spawns the process or prepares the connection. On failure, whatever
    /// this call allocated has already been released.
    async fn initialize(&self) -> Result<()>;

    /// Sends a request and waits up to `timeout` for the response carrying
    /// the same id.
    async fn send(&self, request: Request, timeout: Duration) -> Response;

    /// Fire-and-forget; nothing is awaited beyond the write itself.
    async fn send_notification(&self, notification: Notification) -> Result<()>;

    /// Best-effort shutdown. Calling it more than once is not an error.
    async fn close(&self) -> Result<()>;

    fn is_alive(&self) -> bool;
}

type Waiter = oneshot::Sender<Response>;

#[derive(Default)]
struct Table {
    waiters: HashMap<RequestId, Waiter>,
    /// Set once the stream is gone; new registrations fail with this reason.
    closed: Option<String>,
}

/// Correlation table for requests awaiting a response on a shared stream.
#[derive(Clone, Default)]
pub struct PendingRequests {
    table: Arc<Mutex<Table>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `id`. The returned slot removes the entry when dropped, so a
    /// cancelled or timed out wait never leaves it behind.
    ///
    /// Fails once the table has been closed, so a request registered after
    /// the stream ended is never left waiting for its timeout.
    pub fn register(&self, id: RequestId) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        if table.waiters.contains_key(&id) {
            return Err(Error::protocol(format!("request id {id} is already in flight")));
        }
        table.waiters.insert(id.clone(), tx);
        Ok(PendingRequest {
            id,
            rx,
            table: self.clone(),
        })
    }

    /// Hands a response to the request with the same id.
    ///
    /// Returns false when nobody is waiting for it (unknown or late response).
    pub fn complete(&self, response: Response) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        let waiter = self.table.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Refuses further registrations and completes every waiter with a
    /// synthetic error response built from `err`.
    pub fn close(&self, err: &Error) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            table.closed = Some(err.to_string());
            table.waiters.drain().collect()
        };
        let count = drained.len();
        for (id, tx) in drained {
            let _ = tx.send(Response::from_error(Some(id), err));
        }
        count
    }

    /// Accepts registrations again, for a stream that has been reconnected.
    pub fn reopen(&self) {
        self.table.lock().closed = None;
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed.is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.table.lock().waiters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &RequestId) {
        self.table.lock().waiters.remove(id);
    }
}

/// A registered request waiting for its response.
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<Response>,
    table: PendingRequests,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub async fn wait(mut self, timeout: Duration) -> Response {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::from_error(
                Some(self.id.clone()),
                &Error::ConnectionClosed("response channel dropped".into()),
            ),
            Err(_) => {
                tracing::warn!(id = %self.id, ?timeout, "request timed out");
                Response::from_error(
                    Some(self.id.clone()),
                    &Error::Timeout(format!("no response to request {} within {:?}", self.id, timeout)),
                )
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

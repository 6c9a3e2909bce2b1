//! Connection handle and response routing.
//!
//! The handle owns the transport and a routing table that maps match tags to
//! the oneshot sender of the future waiting on that request. Responses are
//! delivered from whichever task reads the transport; each route is removed
//! on first use, so a future is resolved at most once and duplicate or late
//! responses fall through harmlessly.
//!
//! Futures keep the handle alive through an `Arc`, so the transport outlives
//! every request built on it. The serving side holds a [`WeakHandle`] to
//! avoid a reference cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{errno, Error, ErrorDescriptor, Result};
use crate::transport::{Request, Response, Transport, TransportError};

/// Terminal failure of a request, as stored by its future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Raised on this side: connection severed, handle dropped.
    Local(ErrorDescriptor),
    /// Reported by the remote service.
    Remote(ErrorDescriptor),
}

impl Failure {
    pub fn descriptor(&self) -> &ErrorDescriptor {
        match self {
            Failure::Local(desc) | Failure::Remote(desc) => desc,
        }
    }

    pub(crate) fn into_error(self) -> Error {
        match self {
            Failure::Local(desc) => Error::LocalFault(desc),
            Failure::Remote(desc) => Error::Remote(desc),
        }
    }
}

/// What a route receives: the payload or the failure.
pub(crate) type Outcome = std::result::Result<Option<Vec<u8>>, Failure>;

struct RouteTable {
    next_tag: u32,
    routes: HashMap<u32, oneshot::Sender<Outcome>>,
}

impl RouteTable {
    /// Allocate a tag that is not in use. Tag 0 is reserved for requests
    /// that expect no response.
    fn allocate(&mut self) -> u32 {
        loop {
            let tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1).max(1);
            if !self.routes.contains_key(&tag) {
                return tag;
            }
        }
    }
}

struct HandleInner {
    transport: Box<dyn Transport>,
    routes: Mutex<RouteTable>,
    closed: AtomicBool,
}

/// An open connection to the service.
///
/// Cloning is cheap; all clones share one routing table.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

/// Non-owning reference to a [`Handle`], used by the delivery path.
#[derive(Clone)]
pub struct WeakHandle {
    inner: Weak<HandleInner>,
}

impl Handle {
    /// Wrap a transport in a new handle.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                transport: Box::new(transport),
                routes: Mutex::new(RouteTable {
                    next_tag: 1,
                    routes: HashMap::new(),
                }),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether the handle has stopped accepting requests, either because
    /// it was closed or severed, or because the serving end went away.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.is_disconnected()
    }

    /// Whether the serving end of the transport has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.inner.transport.is_disconnected()
    }

    /// Resolves once the serving end of the transport has gone away.
    pub(crate) fn disconnected(&self) -> BoxFuture<'static, ()> {
        self.inner.transport.disconnected()
    }

    /// Number of requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.inner.routes.lock().unwrap().routes.len()
    }

    /// Register a route and return its tag and receiving end.
    pub(crate) fn register(&self) -> Result<(u32, oneshot::Receiver<Outcome>)> {
        let mut table = self.inner.routes.lock().unwrap();
        // Checked under the lock so that `sever` cannot miss the new route.
        if self.is_closed() {
            return Err(Error::Connection("handle is closed".into()));
        }
        let tag = table.allocate();
        let (tx, rx) = oneshot::channel();
        table.routes.insert(tag, tx);
        Ok((tag, rx))
    }

    /// Drop the route for `matchtag`, if still present.
    pub(crate) fn unregister(&self, matchtag: u32) {
        if self.inner.routes.lock().unwrap().routes.remove(&matchtag).is_some() {
            tracing::trace!(matchtag, "Released route for unresolved request");
        }
    }

    /// Hand a request to the transport.
    pub(crate) fn send(&self, request: Request) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("handle is closed".into()));
        }
        self.inner
            .transport
            .send(request)
            .map_err(|e| Error::Connection(e.to_string()))
    }

    /// Forget per-request transport state for a resolved request.
    pub(crate) fn release(&self, matchtag: u32) {
        self.inner.transport.release(matchtag);
    }

    /// Drop the route for an unresolved request and tell the serving end.
    pub(crate) fn cancel(&self, matchtag: u32) {
        // Unrouted first: a reply racing in after this finds no route and
        // cleans up after itself.
        self.unregister(matchtag);
        self.inner.transport.cancel(matchtag);
    }

    /// Ask the transport for an error string attached to `matchtag`.
    pub(crate) fn error_string(
        &self,
        matchtag: u32,
    ) -> std::result::Result<Option<String>, TransportError> {
        self.inner.transport.error_string(matchtag)
    }

    /// Route a response to the future that owns its match tag.
    ///
    /// Returns false when no future is waiting for it: the future was
    /// dropped, already resolved, or the tag was never issued.
    pub fn deliver(&self, response: Response) -> bool {
        let route = self
            .inner
            .routes
            .lock()
            .unwrap()
            .routes
            .remove(&response.matchtag);

        let Some(tx) = route else {
            tracing::debug!(
                matchtag = response.matchtag,
                "Dropping response with no waiting request"
            );
            return false;
        };

        let outcome = response.result.map_err(Failure::Remote);
        tx.send(outcome).is_ok()
    }

    /// Stop accepting new requests.
    ///
    /// Requests already sent stay routed and can still be answered.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.transport.close();
            tracing::debug!("Handle closed");
        }
    }

    /// Tear the connection down and fail every outstanding request with a
    /// local fault.
    pub fn sever(&self, reason: &str) -> usize {
        let (was_closed, routes) = {
            let mut table = self.inner.routes.lock().unwrap();
            let was_closed = self.inner.closed.swap(true, Ordering::SeqCst);
            (was_closed, std::mem::take(&mut table.routes))
        };
        self.inner.transport.close();

        let count = routes.len();
        for (_, tx) in routes {
            let _ = tx.send(Err(Failure::Local(ErrorDescriptor::with_message(
                errno::ECONNRESET,
                reason,
            ))));
        }

        if !was_closed || count > 0 {
            tracing::warn!(outstanding = count, reason, "Connection severed");
        }
        count
    }
}

impl WeakHandle {
    pub fn upgrade(&self) -> Option<Handle> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }

    /// Deliver a response if the handle still exists.
    pub fn deliver(&self, response: Response) -> bool {
        match self.upgrade() {
            Some(handle) => handle.deliver(response),
            None => {
                tracing::debug!(
                    matchtag = response.matchtag,
                    "Dropping response for destroyed handle"
                );
                false
            }
        }
    }
}

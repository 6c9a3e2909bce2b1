//! Transport boundary between the handle and the service.
//!
//! The handle only needs to push requests out and, for the error fallback,
//! ask for an error string attached to a match tag. Framing and connection
//! setup live behind [`Transport`]. [`channel`] provides the in-process
//! transport used by the broker in [`crate::service`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::error::ErrorDescriptor;
use crate::rpc::{NodeId, RpcFlags};

/// A request as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub matchtag: u32,
    pub topic: String,
    pub nodeid: NodeId,
    pub flags: RpcFlags,
    pub payload: Option<Vec<u8>>,
}

/// A response routed back to the future that owns `matchtag`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub matchtag: u32,
    pub result: Result<Option<Vec<u8>>, ErrorDescriptor>,
}

impl Response {
    pub fn ok(matchtag: u32, payload: Option<Vec<u8>>) -> Self {
        Self {
            matchtag,
            result: Ok(payload),
        }
    }

    pub fn err(matchtag: u32, error: ErrorDescriptor) -> Self {
        Self {
            matchtag,
            result: Err(error),
        }
    }
}

/// What the serving end receives, in the order the client produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    /// The requester stopped waiting for the request with this tag.
    Cancel(u32),
}

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// Outgoing side of a connection.
pub trait Transport: Send + Sync {
    /// Enqueue a request. Must not block.
    fn send(&self, request: Request) -> Result<(), TransportError>;

    /// Look up an error string attached to a request out of band.
    fn error_string(&self, _matchtag: u32) -> Result<Option<String>, TransportError> {
        Ok(None)
    }

    /// Forget any per-request state kept for `matchtag`.
    fn release(&self, _matchtag: u32) {}

    /// Tell the serving end nobody is waiting for `matchtag` any more.
    ///
    /// Implies [`Transport::release`].
    fn cancel(&self, matchtag: u32) {
        self.release(matchtag);
    }

    /// Whether the serving end has gone away.
    fn is_disconnected(&self) -> bool {
        false
    }

    /// Resolves once the serving end has gone away.
    fn disconnected(&self) -> BoxFuture<'static, ()> {
        futures::future::pending().boxed()
    }

    /// Stop accepting requests.
    fn close(&self) {}
}

/// Error strings attached to match tags by the serving side.
#[derive(Debug, Clone, Default)]
pub struct ErrorStrings {
    inner: Arc<Mutex<HashMap<u32, String>>>,
}

impl ErrorStrings {
    /// Attach `message` to the request identified by `matchtag`.
    pub fn annotate(&self, matchtag: u32, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .insert(matchtag, message.into());
    }

    pub fn lookup(&self, matchtag: u32) -> Option<String> {
        self.inner.lock().unwrap().get(&matchtag).cloned()
    }

    pub fn forget(&self, matchtag: u32) {
        self.inner.lock().unwrap().remove(&matchtag);
    }

    /// Number of messages currently attached.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process transport backed by an unbounded channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    errors: ErrorStrings,
    /// Closes when the [`Inbox`] is dropped.
    peer: watch::Receiver<()>,
}

impl Transport for ChannelTransport {
    fn send(&self, request: Request) -> Result<(), TransportError> {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx
                .send(Frame::Request(request))
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn error_string(&self, matchtag: u32) -> Result<Option<String>, TransportError> {
        let open = self
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed());
        if !open {
            return Err(TransportError::Closed);
        }
        Ok(self.errors.lookup(matchtag))
    }

    fn release(&self, matchtag: u32) {
        self.errors.forget(matchtag);
    }

    fn cancel(&self, matchtag: u32) {
        self.release(matchtag);
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Frame::Cancel(matchtag));
        }
    }

    fn is_disconnected(&self) -> bool {
        self.peer.has_changed().is_err()
    }

    fn disconnected(&self) -> BoxFuture<'static, ()> {
        let mut peer = self.peer.clone();
        async move { while peer.changed().await.is_ok() {} }.boxed()
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Serving end of a [`ChannelTransport`].
///
/// Dropping it disconnects the client.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Frame>,
    errors: ErrorStrings,
    _alive: watch::Sender<()>,
}

impl Inbox {
    /// Receive the next frame, or `None` once the transport is closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive the next request, skipping cancellations.
    pub async fn recv(&mut self) -> Option<Request> {
        loop {
            match self.rx.recv().await? {
                Frame::Request(request) => return Some(request),
                Frame::Cancel(_) => continue,
            }
        }
    }

    /// Handle for attaching error strings to requests.
    pub fn error_strings(&self) -> ErrorStrings {
        self.errors.clone()
    }
}

/// Create a connected in-process transport and its serving end.
pub fn channel() -> (ChannelTransport, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (alive, peer) = watch::channel(());
    let errors = ErrorStrings::default();
    (
        ChannelTransport {
            tx: Mutex::new(Some(tx)),
            errors: errors.clone(),
            peer,
        },
        Inbox {
            rx,
            errors,
            _alive: alive,
        },
    )
}

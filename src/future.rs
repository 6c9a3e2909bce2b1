//! Single-resolution futures for outstanding requests.

use std::time::Instant;

use futures::future::select_all;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{errno, ErrorDescriptor, Result};
use crate::handle::{Failure, Handle, Outcome};
use crate::observability::metrics::record_rpc;
use crate::rpc::resolve_error;

#[derive(Debug)]
enum State {
    Pending(oneshot::Receiver<Outcome>),
    Fulfilled(Option<Vec<u8>>),
    Failed(Failure),
}

/// The eventual outcome of one request.
///
/// Moves from pending to fulfilled or failed exactly once. Dropping a
/// pending future releases its route and cancels the request on the
/// serving end; a response arriving afterwards is discarded.
pub struct RpcFuture {
    handle: Handle,
    matchtag: u32,
    topic: String,
    state: State,
    submitted_at: Instant,
}

impl RpcFuture {
    pub(crate) fn pending(
        handle: Handle,
        matchtag: u32,
        topic: String,
        rx: oneshot::Receiver<Outcome>,
    ) -> Self {
        Self {
            handle,
            matchtag,
            topic,
            state: State::Pending(rx),
            submitted_at: Instant::now(),
        }
    }

    /// A future that is already fulfilled, for requests sent without
    /// expecting a response.
    pub(crate) fn fulfilled(handle: Handle, topic: String, payload: Option<Vec<u8>>) -> Self {
        Self {
            handle,
            matchtag: 0,
            topic,
            state: State::Fulfilled(payload),
            submitted_at: Instant::now(),
        }
    }

    /// Match tag identifying this request on its handle (0 if unrouted).
    pub fn matchtag(&self) -> u32 {
        self.matchtag
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending(_))
    }

    /// Suspend until the future is terminal and return its payload or error.
    ///
    /// Calling this again after resolution returns the stored result.
    pub async fn wait(&mut self) -> Result<Option<&[u8]>> {
        self.settled().await;
        match &self.state {
            State::Fulfilled(payload) => Ok(payload.as_deref()),
            State::Failed(failure) => Err(failure.clone().into_error()),
            State::Pending(_) => unreachable!("settled future is terminal"),
        }
    }

    /// The stored failure, if the future failed.
    pub fn failure(&self) -> Option<&Failure> {
        match &self.state {
            State::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Suspend until the future is terminal.
    ///
    /// Losing the serving end severs the handle, which fails this and every
    /// other outstanding request.
    pub(crate) async fn settled(&mut self) {
        if let State::Pending(rx) = &mut self.state {
            let outcome = tokio::select! {
                biased;
                outcome = &mut *rx => outcome,
                () = self.handle.disconnected() => {
                    self.handle.sever("connection closed by peer");
                    rx.await
                }
            };
            self.settle(outcome.unwrap_or_else(|_| Err(route_dropped())));
        }
    }

    /// Settle without suspending. Returns true if the future is terminal.
    pub fn try_settle(&mut self) -> bool {
        let outcome = match &mut self.state {
            State::Pending(rx) => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) if self.handle.is_disconnected() => {
                    self.handle.sever("connection closed by peer");
                    rx.try_recv().unwrap_or_else(|_| Err(route_dropped()))
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Closed) => Err(route_dropped()),
            },
            _ => return true,
        };
        self.settle(outcome);
        true
    }

    /// Fill in a missing failure message from the transport's error
    /// string lookup.
    ///
    /// The result is stored, so later calls never see a sparser message
    /// even after the transport has released the tag.
    pub(crate) fn resolve_message(&mut self) {
        let State::Failed(Failure::Local(desc) | Failure::Remote(desc)) = &mut self.state else {
            return;
        };
        if desc.has_message() {
            return;
        }
        let handle = &self.handle;
        let matchtag = self.matchtag;
        *desc = resolve_error(desc.clone(), || handle.error_string(matchtag));
    }

    fn settle(&mut self, outcome: Outcome) {
        if !self.is_pending() {
            return;
        }
        let latency = self.submitted_at.elapsed().as_secs_f64();
        record_rpc(&self.topic, latency, outcome.is_ok());

        tracing::trace!(
            matchtag = self.matchtag,
            topic = %self.topic,
            ok = outcome.is_ok(),
            latency_ms = latency * 1000.0,
            "Request resolved"
        );

        self.state = match outcome {
            Ok(payload) => State::Fulfilled(payload),
            Err(failure) => State::Failed(failure),
        };
    }
}

impl Drop for RpcFuture {
    fn drop(&mut self) {
        if self.matchtag == 0 {
            return;
        }
        if self.is_pending() {
            self.handle.cancel(self.matchtag);
        } else {
            self.handle.release(self.matchtag);
        }
    }
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFuture")
            .field("matchtag", &self.matchtag)
            .field("topic", &self.topic)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn route_dropped() -> Failure {
    Failure::Local(ErrorDescriptor::with_message(
        errno::ECONNRESET,
        "connection dropped before a response arrived",
    ))
}

/// Suspend until at least one future in `futures` is terminal and return
/// its index.
///
/// Returns `None` for an empty slice. When several are ready, the lowest
/// index wins; callers remove the returned future before waiting again.
pub async fn wait_any(futures: &mut [RpcFuture]) -> Option<usize> {
    if futures.is_empty() {
        return None;
    }
    if let Some(index) = futures.iter_mut().position(RpcFuture::try_settle) {
        return Some(index);
    }

    let waits = futures.iter_mut().map(|f| Box::pin(f.settled()));
    let ((), index, _) = select_all(waits).await;
    Some(index)
}

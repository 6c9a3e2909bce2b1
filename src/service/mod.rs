//! In-process broker answering requests by topic.
//!
//! Each request is handled in its own task, so responses come back in
//! whatever order handlers finish. Responses are routed through a
//! [`WeakHandle`]; once the client drops its handle they are discarded.

pub mod jobs;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{errno, ErrorDescriptor};
use crate::handle::WeakHandle;
use crate::rpc::RpcFlags;
use crate::transport::{ErrorStrings, Frame, Inbox, Request, Response};

pub use jobs::JobManager;

/// What a handler answers with.
pub type Reply = Result<Option<Vec<u8>>, ErrorDescriptor>;

type BoxHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Handler tasks still running, keyed by match tag.
///
/// The sequence number tells a finishing task whether its entry has since
/// been replaced by a request that reused the tag.
#[derive(Default)]
struct InFlight {
    next_seq: u64,
    tasks: HashMap<u32, (u64, JoinHandle<()>)>,
}

type SharedInFlight = Arc<Mutex<InFlight>>;

/// Topic router for the in-process service.
#[derive(Clone, Default)]
pub struct Broker {
    handlers: HashMap<String, BoxHandler>,
    detach_error_strings: bool,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`.
    #[must_use]
    pub fn route<F, Fut>(mut self, topic: &str, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Reply> + Send + 'static,
    {
        self.handlers
            .insert(topic.to_string(), Arc::new(move |req| handler(req).boxed()));
        self
    }

    /// Serve the job-manager topics from `jobs`.
    #[must_use]
    pub fn with_job_manager(self, jobs: JobManager) -> Self {
        let submit = jobs.clone();
        self.route(crate::job::SUBMIT_TOPIC, move |req| {
            let jobs = submit.clone();
            async move { jobs.submit(req).await }
        })
        .route(crate::job::WAIT_TOPIC, move |req| {
            let jobs = jobs.clone();
            async move { jobs.wait(req).await }
        })
    }

    /// Send error messages out of band instead of inline.
    ///
    /// Error responses go out bare and their message is attached to the
    /// request's match tag, where the client's error-string lookup finds it.
    #[must_use]
    pub fn detach_error_strings(mut self, detach: bool) -> Self {
        self.detach_error_strings = detach;
        self
    }

    /// Serve requests from `inbox` until it closes or `shutdown` fires.
    ///
    /// When the client closes its end, requests already accepted are still
    /// answered before returning. On shutdown they are abandoned. Either way
    /// `inbox` is dropped on return, which disconnects the client.
    pub async fn serve(
        self,
        mut inbox: Inbox,
        handle: WeakHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let errors = inbox.error_strings();
        let in_flight = SharedInFlight::default();
        tracing::debug!(topics = self.handlers.len(), "Broker started");

        let closed_by_client = loop {
            tokio::select! {
                frame = inbox.next_frame() => match frame {
                    Some(Frame::Request(request)) => {
                        self.dispatch(request, &handle, &errors, &in_flight);
                    }
                    Some(Frame::Cancel(matchtag)) => cancel(&in_flight, matchtag).await,
                    None => {
                        tracing::debug!("Inbox closed, stopping broker");
                        break true;
                    }
                },
                _ = shutdown.changed() => {
                    tracing::debug!("Shutdown signal received, stopping broker");
                    break false;
                }
            }
        };

        let remaining: Vec<_> = in_flight
            .lock()
            .unwrap()
            .tasks
            .drain()
            .map(|(_, (_, task))| task)
            .collect();
        if closed_by_client && !remaining.is_empty() {
            tracing::debug!(outstanding = remaining.len(), "Draining in-flight requests");
            let aborts: Vec<_> = remaining.iter().map(JoinHandle::abort_handle).collect();
            tokio::select! {
                _ = futures::future::join_all(remaining) => {}
                _ = shutdown.changed() => {
                    for abort in aborts {
                        abort.abort();
                    }
                }
            }
        } else {
            for task in remaining {
                task.abort();
            }
        }
    }

    fn dispatch(
        &self,
        request: Request,
        handle: &WeakHandle,
        errors: &ErrorStrings,
        in_flight: &SharedInFlight,
    ) {
        let matchtag = request.matchtag;
        let expects_response = !request.flags.contains(RpcFlags::NORESPONSE);

        let Some(handler) = self.handlers.get(&request.topic).cloned() else {
            tracing::debug!(topic = %request.topic, matchtag, "No handler for topic");
            if expects_response {
                handle.deliver(Response::err(matchtag, ErrorDescriptor::bare(errno::ENOSYS)));
            }
            return;
        };

        let handle = handle.clone();
        let errors = errors.clone();
        let detach = self.detach_error_strings;

        // Held across the spawn so the task cannot finish before it is tracked.
        let mut tracked = in_flight.lock().unwrap();
        let seq = tracked.next_seq;
        tracked.next_seq += 1;
        let registry = in_flight.clone();

        let task = tokio::spawn(async move {
            let reply = handler(request).await;
            if expects_response {
                let result = match reply {
                    Err(ErrorDescriptor {
                        code,
                        message: Some(message),
                    }) if detach => {
                        errors.annotate(matchtag, message);
                        Err(ErrorDescriptor::bare(code))
                    }
                    other => other,
                };
                if !handle.deliver(Response { matchtag, result }) && detach {
                    // Nobody is left to look the message up.
                    errors.forget(matchtag);
                }
            }

            let mut tracked = registry.lock().unwrap();
            if tracked.tasks.get(&matchtag).is_some_and(|(s, _)| *s == seq) {
                tracked.tasks.remove(&matchtag);
            }
        });

        if expects_response {
            tracked.tasks.insert(matchtag, (seq, task));
        }
    }
}

/// Stop the handler for `matchtag`, waiting until it has been dropped so
/// that whatever it held is released before the next frame is served.
async fn cancel(in_flight: &SharedInFlight, matchtag: u32) {
    let task = in_flight.lock().unwrap().tasks.remove(&matchtag);
    if let Some((_, task)) = task {
        tracing::debug!(matchtag, "Request cancelled by client");
        task.abort();
        let _ = task.await;
    }
}

//! Request construction, submission and result decoding.
//!
//! ```no_run
//! # async fn demo(handle: tether::Handle) -> tether::Result<()> {
//! use serde_json::json;
//! use tether::RpcRequest;
//!
//! let mut fut = RpcRequest::new("kvs.lookup")
//!     .payload(json!({"key": "resource.R"}))
//!     .submit(&handle)?;
//! let value: serde_json::Value = fut.get().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use serde::de::DeserializeOwned;

use crate::codec::{self, Payload};
use crate::error::{Error, ErrorDescriptor, Result};
use crate::future::RpcFuture;
use crate::handle::Handle;
use crate::observability::metrics::record_submit;
use crate::transport::Request;

/// Where a request should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeId {
    /// No node preference.
    #[default]
    Any,
    /// The parent of the local node.
    Upstream,
    /// A specific rank.
    Rank(u32),
}

impl NodeId {
    const ANY: u32 = 0xFFFF_FFFF;
    const UPSTREAM: u32 = 0xFFFF_FFFE;

    /// Value used on the wire.
    pub fn as_raw(self) -> u32 {
        match self {
            NodeId::Any => Self::ANY,
            NodeId::Upstream => Self::UPSTREAM,
            NodeId::Rank(rank) => rank,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::ANY => NodeId::Any,
            Self::UPSTREAM => NodeId::Upstream,
            rank => NodeId::Rank(rank),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Any => f.write_str("any"),
            NodeId::Upstream => f.write_str("upstream"),
            NodeId::Rank(rank) => write!(f, "{rank}"),
        }
    }
}

bitflags::bitflags! {
    /// Flags modifying how a request is dispatched.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct RpcFlags: u32 {
        /// No response is expected; the future is fulfilled on send.
        const NORESPONSE = 1;
        /// The service may send multiple responses.
        const STREAMING = 2;
    }
}

/// A request waiting to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    topic: String,
    payload: Payload,
    nodeid: NodeId,
    flags: RpcFlags,
}

impl RpcRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Absent,
            nodeid: NodeId::Any,
            flags: RpcFlags::empty(),
        }
    }

    /// Set the request body. Text and bytes go out as-is, JSON values are
    /// encoded.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn target(mut self, nodeid: NodeId) -> Self {
        self.nodeid = nodeid;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: RpcFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send the request on `handle` and return its future.
    ///
    /// Never blocks. Fails immediately if the handle cannot take requests.
    #[tracing::instrument(skip_all, fields(topic = %self.topic, nodeid = %self.nodeid))]
    pub fn submit(self, handle: &Handle) -> Result<RpcFuture> {
        if self.topic.is_empty() {
            return Err(Error::InvalidRequest("topic cannot be empty".into()));
        }
        let body = codec::encode(&self.payload)?;

        if self.flags.contains(RpcFlags::NORESPONSE) {
            handle.send(Request {
                matchtag: 0,
                topic: self.topic.clone(),
                nodeid: self.nodeid,
                flags: self.flags,
                payload: body,
            })?;
            record_submit(&self.topic);
            return Ok(RpcFuture::fulfilled(handle.clone(), self.topic, None));
        }

        let (matchtag, rx) = handle.register()?;
        let request = Request {
            matchtag,
            topic: self.topic.clone(),
            nodeid: self.nodeid,
            flags: self.flags,
            payload: body,
        };
        if let Err(e) = handle.send(request) {
            handle.unregister(matchtag);
            return Err(e);
        }

        record_submit(&self.topic);
        tracing::debug!(matchtag, "Request submitted");
        Ok(RpcFuture::pending(handle.clone(), matchtag, self.topic, rx))
    }
}

/// Submit a request with every field spelled out.
pub fn submit(
    handle: &Handle,
    topic: &str,
    payload: impl Into<Payload>,
    nodeid: NodeId,
    flags: RpcFlags,
) -> Result<RpcFuture> {
    RpcRequest::new(topic)
        .payload(payload)
        .target(nodeid)
        .flags(flags)
        .submit(handle)
}

impl Handle {
    /// Submit `topic` with `payload` to any node.
    pub fn rpc(&self, topic: &str, payload: impl Into<Payload>) -> Result<RpcFuture> {
        RpcRequest::new(topic).payload(payload).submit(self)
    }
}

/// Pick the most specific error available for a failed request.
///
/// A descriptor that already carries a message is returned unchanged.
/// Otherwise `lookup` is consulted once; if it fails or finds nothing, the
/// original bare descriptor is returned.
pub fn resolve_error<F, E>(descriptor: ErrorDescriptor, lookup: F) -> ErrorDescriptor
where
    F: FnOnce() -> std::result::Result<Option<String>, E>,
    E: fmt::Display,
{
    if descriptor.has_message() {
        return descriptor;
    }
    match lookup() {
        Ok(Some(message)) if !message.is_empty() => ErrorDescriptor {
            code: descriptor.code,
            message: Some(message),
        },
        Ok(_) => descriptor,
        Err(e) => {
            tracing::debug!(error = %e, code = descriptor.code, "Error string lookup failed");
            descriptor
        }
    }
}

impl RpcFuture {
    /// Wait for the response and return its raw body.
    pub async fn get_raw(&mut self) -> Result<Vec<u8>> {
        self.settle_with_message().await;
        self.wait()
            .await
            .map(|payload| payload.unwrap_or_default().to_vec())
    }

    /// Wait for the response and return its body as text.
    pub async fn get_str(&mut self) -> Result<String> {
        self.settle_with_message().await;
        codec::decode_str(self.wait().await?).map(str::to_owned)
    }

    /// Wait for the response and decode its body from canonical JSON.
    pub async fn get<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.settle_with_message().await;
        codec::decode(self.wait().await?)
    }

    /// Settle, then replace a bare failure with the looked-up message.
    async fn settle_with_message(&mut self) {
        self.settled().await;
        self.resolve_message();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;
    use crate::transport::{self, Inbox, Response};
    use serde_json::{json, Value};

    fn handle() -> (Handle, Inbox) {
        let (transport, inbox) = transport::channel();
        (Handle::new(transport), inbox)
    }

    #[test]
    fn test_nodeid_wire_values() {
        assert_eq!(NodeId::Any.as_raw(), 0xFFFF_FFFF);
        assert_eq!(NodeId::from_raw(0xFFFF_FFFE), NodeId::Upstream);
        assert_eq!(NodeId::from_raw(3), NodeId::Rank(3));
        assert_eq!(NodeId::default(), NodeId::Any);
    }

    #[test]
    fn test_empty_topic_rejected() {
        let (handle, _inbox) = handle();
        let err = RpcRequest::new("").submit(&handle).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_sends_encoded_request() {
        let (handle, mut inbox) = handle();
        let fut = submit(
            &handle,
            "job-manager.submit",
            json!({"flags": 4}),
            NodeId::Rank(0),
            RpcFlags::STREAMING,
        )
        .unwrap();

        let request = inbox.recv().await.unwrap();
        assert_eq!(request.matchtag, fut.matchtag());
        assert_eq!(request.topic, "job-manager.submit");
        assert_eq!(request.nodeid, NodeId::Rank(0));
        assert_eq!(request.flags, RpcFlags::STREAMING);
        assert_eq!(request.payload.as_deref(), Some(&br#"{"flags":4}"#[..]));
    }

    #[tokio::test]
    async fn test_raw_text_is_not_reencoded() {
        let (handle, mut inbox) = handle();
        let _fut = handle.rpc("test.echo", "\"already quoted\"").unwrap();

        let request = inbox.recv().await.unwrap();
        assert_eq!(
            request.payload.as_deref(),
            Some("\"already quoted\"".as_bytes())
        );
    }

    #[test]
    fn test_submit_on_closed_handle_fails_synchronously() {
        let (handle, _inbox) = handle();
        handle.close();
        let err = handle.rpc("test.echo", None::<String>).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_transport_refusal_releases_route() {
        let (handle, inbox) = handle();
        drop(inbox);
        let err = handle.rpc("test.echo", None::<String>).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn test_noresponse_future_is_fulfilled_immediately() {
        let (handle, mut inbox) = handle();
        let mut fut = RpcRequest::new("log.append")
            .payload("line")
            .flags(RpcFlags::NORESPONSE)
            .submit(&handle)
            .unwrap();

        assert!(!fut.is_pending());
        assert_eq!(fut.get_raw().await.unwrap(), Vec::<u8>::new());
        assert_eq!(inbox.recv().await.unwrap().matchtag, 0);
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn test_get_decodes_structured_response() {
        let (handle, mut inbox) = handle();
        let mut fut = handle.rpc("test.echo", json!({"a": [1, 2]})).unwrap();
        let request = inbox.recv().await.unwrap();
        handle.deliver(Response::ok(request.matchtag, request.payload));

        let value: Value = fut.get().await.unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_get_reports_decoding_error() {
        let (handle, _inbox) = handle();
        let mut fut = handle.rpc("test.echo", None::<String>).unwrap();
        handle.deliver(Response::ok(fut.matchtag(), Some(b"not json".to_vec())));

        assert!(matches!(fut.get::<Value>().await, Err(Error::Decoding(_))));
        assert_eq!(fut.get_str().await.unwrap(), "not json");
    }

    #[test]
    fn test_resolve_error_keeps_existing_message() {
        let desc = ErrorDescriptor::with_message(errno::EINVAL, "original");
        let resolved = resolve_error(desc.clone(), || {
            Ok::<_, std::io::Error>(Some("other".into()))
        });
        assert_eq!(resolved, desc);
    }

    #[test]
    fn test_resolve_error_uses_lookup() {
        let resolved = resolve_error(ErrorDescriptor::bare(errno::ENOENT), || {
            Ok::<_, std::io::Error>(Some("job 42 not found".into()))
        });
        assert_eq!(
            resolved,
            ErrorDescriptor::with_message(errno::ENOENT, "job 42 not found")
        );
    }

    #[test]
    fn test_resolve_error_falls_back_to_bare() {
        let bare = ErrorDescriptor::bare(errno::ENOENT);
        let missing = resolve_error(bare.clone(), || Ok::<_, std::io::Error>(None));
        assert_eq!(missing, bare);

        let failed = resolve_error(bare.clone(), || {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "gone"))
        });
        assert_eq!(failed, bare);
    }

    #[tokio::test]
    async fn test_get_looks_up_missing_error_string() {
        let (handle, inbox) = handle();
        let mut fut = handle.rpc("test.fail", None::<String>).unwrap();
        inbox
            .error_strings()
            .annotate(fut.matchtag(), "permission denied by policy");
        handle.deliver(Response::err(fut.matchtag(), ErrorDescriptor::bare(errno::EINVAL)));

        match fut.get_str().await {
            Err(Error::Remote(desc)) => {
                assert_eq!(desc.code, errno::EINVAL);
                assert_eq!(desc.message.as_deref(), Some("permission denied by policy"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolved_message_outlives_released_annotation() {
        let (handle, inbox) = handle();
        let errors = inbox.error_strings();
        let mut fut = handle.rpc("test.fail", None::<String>).unwrap();
        errors.annotate(fut.matchtag(), "quota exceeded");
        handle.deliver(Response::err(fut.matchtag(), ErrorDescriptor::bare(errno::EPROTO)));

        let first = fut.get_raw().await.unwrap_err();
        errors.forget(fut.matchtag());
        let second = fut.get_raw().await.unwrap_err();

        assert_eq!(first.descriptor(), second.descriptor());
        assert_eq!(second.to_string(), "remote error: quota exceeded");

        drop(fut);
        assert!(errors.is_empty());
    }
}

//! Tether: a future-based RPC client with sliding-window job admission.
//!
//! A single [`Handle`] multiplexes many in-flight requests. Each request is
//! represented by an [`RpcFuture`] that resolves exactly once, either from a
//! matching response or from a local fault when the connection goes away.
//! On top of that, [`window::SlidingWindow`] admits work items while keeping
//! at most `W` of them outstanding.
//!
//! # Modules
//!
//! - [`codec`]: Payload encoding (raw pass-through or canonical JSON)
//! - [`config`]: CLI and environment configuration
//! - [`error`]: Error taxonomy shared by every layer
//! - [`handle`]: Connection handle and response routing table
//! - [`future`]: Single-resolution futures and `wait_any`
//! - [`rpc`]: Request builder and submission
//! - [`job`]: Job submit/wait built on the RPC client
//! - [`window`]: Bounded-concurrency admission controller
//! - [`transport`]: Transport boundary and the in-process channel transport
//! - [`service`]: In-process broker used by the driver and the tests
//! - [`observability`]: Metrics and tracing setup

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // rpc::RpcRequest is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::similar_names,              // tag/tags/matchtag are fine
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod codec;
pub mod config;
pub mod error;
pub mod future;
pub mod handle;
pub mod job;
pub mod observability;
pub mod rpc;
pub mod service;
pub mod transport;
pub mod window;

pub use codec::Payload;
pub use error::{Error, ErrorDescriptor, Result};
pub use future::{wait_any, RpcFuture};
pub use handle::{Handle, WeakHandle};
pub use rpc::{NodeId, RpcFlags, RpcRequest};

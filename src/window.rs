//! Sliding-window admission control.
//!
//! [`SlidingWindow`] drives a [`Workload`] until `target` items have been
//! admitted and completed, never letting more than `capacity` be in flight.
//! A slot is refilled as soon as any item completes; completion order is
//! whatever the workload reports. Failed items count as completed and are
//! reported, never retried.

use std::fmt;

use crate::error::{Error, Result};
use crate::future::{wait_any, RpcFuture};
use crate::handle::Handle;
use crate::observability::metrics::{record_completion, record_in_flight};
use crate::rpc::RpcRequest;

/// Validated window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    target: u64,
    capacity: usize,
}

impl WindowConfig {
    /// `target` items, at most `capacity` outstanding.
    ///
    /// A capacity of zero could never admit anything and is rejected.
    pub fn new(target: u64, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Configuration(
                "window capacity must be at least 1".into(),
            ));
        }
        Ok(Self { target, capacity })
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Outcome of one completed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion<Id> {
    pub id: Id,
    pub success: bool,
    /// Most specific failure message available.
    pub error: Option<String>,
}

impl<Id> Completion<Id> {
    pub fn success(id: Id) -> Self {
        Self {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failure(id: Id, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Source of work items for a window.
#[allow(async_fn_in_trait)]
pub trait Workload {
    type Id: fmt::Display + Clone;

    /// Submit item number `index` without waiting for it.
    ///
    /// An error aborts the window.
    async fn admit(&mut self, index: u64) -> Result<Self::Id>;

    /// Suspend until any admitted item completes.
    async fn drain(&mut self) -> Result<Completion<Self::Id>>;
}

/// Progress notifications emitted while the window runs.
#[derive(Debug)]
pub enum WindowEvent<'a, Id> {
    Admitted { id: &'a Id, in_flight: usize },
    Completed { completion: &'a Completion<Id>, in_flight: usize },
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport<Id> {
    pub submitted: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failures: Vec<Completion<Id>>,
    pub peak_in_flight: usize,
}

/// Bounded-concurrency admission controller.
#[derive(Debug)]
pub struct SlidingWindow {
    config: WindowConfig,
    submitted: u64,
    completed: u64,
    in_flight: usize,
    peak_in_flight: usize,
}

impl SlidingWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            submitted: 0,
            completed: 0,
            in_flight: 0,
            peak_in_flight: 0,
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn can_admit(&self) -> bool {
        self.in_flight < self.config.capacity && self.submitted < self.config.target
    }

    /// Run the window to completion.
    #[tracing::instrument(
        skip_all,
        fields(target = self.config.target, capacity = self.config.capacity)
    )]
    pub async fn run<W, F>(
        &mut self,
        workload: &mut W,
        mut observe: F,
    ) -> Result<WindowReport<W::Id>>
    where
        W: Workload,
        F: FnMut(WindowEvent<'_, W::Id>),
    {
        let mut succeeded = 0;
        let mut failures = Vec::new();

        while self.completed < self.config.target {
            while self.can_admit() {
                let id = workload.admit(self.submitted).await?;
                self.submitted += 1;
                self.in_flight += 1;
                self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
                debug_assert!(self.in_flight <= self.config.capacity);
                record_in_flight(self.in_flight);

                tracing::debug!(%id, in_flight = self.in_flight, "Admitted");
                observe(WindowEvent::Admitted {
                    id: &id,
                    in_flight: self.in_flight,
                });
            }

            // Either the window is full or everything has been admitted.
            let completion = workload.drain().await?;
            self.in_flight -= 1;
            self.completed += 1;
            debug_assert!(self.completed <= self.submitted);
            record_in_flight(self.in_flight);
            record_completion(completion.success);

            if completion.success {
                succeeded += 1;
                tracing::debug!(id = %completion.id, "Completed");
            } else {
                tracing::warn!(
                    id = %completion.id,
                    error = completion.error.as_deref().unwrap_or("unknown error"),
                    "Completed with failure"
                );
            }
            observe(WindowEvent::Completed {
                completion: &completion,
                in_flight: self.in_flight,
            });
            if !completion.success {
                failures.push(completion);
            }
        }

        tracing::info!(
            submitted = self.submitted,
            succeeded,
            failed = failures.len(),
            "Window finished"
        );

        Ok(WindowReport {
            submitted: self.submitted,
            completed: self.completed,
            succeeded,
            failures,
            peak_in_flight: self.peak_in_flight,
        })
    }
}

/// Workload issuing one RPC per item.
///
/// `build` produces the request for each item index. Items complete in
/// response order, and a failed response becomes a failed completion
/// carrying the most specific error message.
pub struct RpcWorkload<F> {
    handle: Handle,
    build: F,
    ids: Vec<u64>,
    outstanding: Vec<RpcFuture>,
}

impl<F> RpcWorkload<F>
where
    F: FnMut(u64) -> RpcRequest,
{
    pub fn new(handle: Handle, build: F) -> Self {
        Self {
            handle,
            build,
            ids: Vec::new(),
            outstanding: Vec::new(),
        }
    }

    /// Number of requests still pending.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl<F> Workload for RpcWorkload<F>
where
    F: FnMut(u64) -> RpcRequest,
{
    type Id = u64;

    async fn admit(&mut self, index: u64) -> Result<u64> {
        let fut = (self.build)(index).submit(&self.handle)?;
        self.ids.push(index);
        self.outstanding.push(fut);
        Ok(index)
    }

    async fn drain(&mut self) -> Result<Completion<u64>> {
        let Some(ready) = wait_any(&mut self.outstanding).await else {
            return Err(Error::InvalidRequest(
                "drain called with nothing outstanding".into(),
            ));
        };
        let id = self.ids.swap_remove(ready);
        let mut fut = self.outstanding.swap_remove(ready);

        Ok(match fut.get_raw().await {
            Ok(_) => Completion::success(id),
            Err(e) => Completion::failure(id, e.to_string()),
        })
    }
}

//! Job submission and completion built on the RPC client.
//!
//! `submit_job` asks the job manager to enqueue a jobspec and returns the
//! assigned id. `wait_job` suspends until any waitable job of this client
//! finishes; completions come back in whatever order jobs end.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::Payload;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::rpc::RpcRequest;
use crate::window::{Completion, Workload};

/// Topic accepting new jobs.
pub const SUBMIT_TOPIC: &str = "job-manager.submit";
/// Topic reporting finished waitable jobs.
pub const WAIT_TOPIC: &str = "job-manager.wait";
/// Wildcard id for waiting on any job.
pub const JOBID_ANY: u64 = u64::MAX;

bitflags::bitflags! {
    /// Job submission flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct JobFlags: u32 {
        /// Hold the job until released.
        const PRE_HOLD = 1;
        /// Emit extra debug events for the job.
        const DEBUG = 2;
        /// The job's result can be collected with `wait_job`.
        const WAITABLE = 4;
    }
}

/// Identifier assigned by the job manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimal jobspec: one task running `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub version: u32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub system: SystemAttributes,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemAttributes {
    /// Run time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl JobSpec {
    /// A jobspec running a single command.
    pub fn command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: 1,
            tasks: vec![Task {
                command: command.into_iter().map(Into::into).collect(),
            }],
            attributes: Attributes::default(),
        }
    }

    #[must_use]
    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.attributes.system.duration_ms = Some(duration_ms);
        self
    }

    /// The jobspec as JSON text, the form it is submitted in.
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encoding(e.to_string()))
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    jobspec: &'a str,
    flags: u32,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: JobId,
}

#[derive(Serialize)]
struct WaitRequest {
    id: u64,
}

#[derive(Deserialize)]
struct WaitResponse {
    id: JobId,
    success: bool,
    #[serde(default)]
    errstr: Option<String>,
}

/// Result of waiting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWait {
    pub id: JobId,
    pub success: bool,
    /// Why the job failed, when it did.
    pub error: Option<String>,
}

/// Submit `jobspec` and return the id the job manager assigned.
#[tracing::instrument(skip_all, fields(flags = flags.bits()))]
pub async fn submit_job(handle: &Handle, jobspec: &str, flags: JobFlags) -> Result<JobId> {
    let payload = Payload::structured(&SubmitRequest {
        jobspec,
        flags: flags.bits(),
    })?;
    let mut fut = RpcRequest::new(SUBMIT_TOPIC).payload(payload).submit(handle)?;
    let response: SubmitResponse = fut.get().await?;
    tracing::debug!(jobid = %response.id, "Job submitted");
    Ok(response.id)
}

/// Wait for any waitable job submitted on this handle to finish.
pub async fn wait_job(handle: &Handle) -> Result<JobWait> {
    wait_job_id(handle, JOBID_ANY).await
}

/// Wait for job `id` (or [`JOBID_ANY`]) to finish.
pub async fn wait_job_id(handle: &Handle, id: u64) -> Result<JobWait> {
    let payload = Payload::structured(&WaitRequest { id })?;
    let mut fut = RpcRequest::new(WAIT_TOPIC).payload(payload).submit(handle)?;
    let response: WaitResponse = fut.get().await?;
    Ok(JobWait {
        id: response.id,
        success: response.success,
        error: response.errstr.filter(|_| !response.success),
    })
}

/// Window workload that submits one job per item and waits on any.
///
/// If the connection is lost while waiting, the wait itself fails rather
/// than reporting a job. The oldest outstanding job is then reported as
/// failed with that error, so the window still accounts for every item.
pub struct JobWorkload {
    handle: Handle,
    jobspec: String,
    flags: JobFlags,
    outstanding: BTreeSet<JobId>,
}

impl JobWorkload {
    /// Submit `jobspec` for every item. `WAITABLE` is always added.
    pub fn new(handle: Handle, jobspec: impl Into<String>, flags: JobFlags) -> Self {
        Self {
            handle,
            jobspec: jobspec.into(),
            flags: flags | JobFlags::WAITABLE,
            outstanding: BTreeSet::new(),
        }
    }

    /// Jobs submitted and not yet reported.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl Workload for JobWorkload {
    type Id = JobId;

    async fn admit(&mut self, _index: u64) -> Result<JobId> {
        let id = submit_job(&self.handle, &self.jobspec, self.flags).await?;
        self.outstanding.insert(id);
        Ok(id)
    }

    async fn drain(&mut self) -> Result<Completion<JobId>> {
        match wait_job(&self.handle).await {
            Ok(wait) => {
                self.outstanding.remove(&wait.id);
                Ok(if wait.success {
                    Completion::success(wait.id)
                } else {
                    let error = wait.error.unwrap_or_else(|| "job failed".to_string());
                    Completion::failure(wait.id, error)
                })
            }
            Err(e @ (Error::LocalFault(_) | Error::Connection(_))) => {
                let Some(id) = self.outstanding.pop_first() else {
                    return Err(e);
                };
                Ok(Completion::failure(id, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

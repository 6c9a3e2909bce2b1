//! Simulated job manager serving `job-manager.submit` and `job-manager.wait`.
//!
//! Jobs run for their requested duration on a timer and then finish. A
//! job whose command is `false` exits non-zero; everything else succeeds.
//! Finished waitable jobs are held until someone waits on them, either by
//! id or with the `ANY` wildcard.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::Reply;
use crate::error::{errno, ErrorDescriptor};
use crate::job::{JobFlags, JobId, JobSpec, JOBID_ANY};
use crate::transport::Request;

#[derive(Deserialize)]
struct SubmitRequest {
    jobspec: String,
    #[serde(default)]
    flags: u32,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: JobId,
}

#[derive(Deserialize)]
struct WaitRequest {
    id: u64,
}

#[derive(Debug, Clone, Serialize)]
struct WaitResponse {
    id: JobId,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    errstr: Option<String>,
}

#[derive(Debug)]
struct JobEntry {
    waitable: bool,
    result: Option<WaitResponse>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<WaitResponse, ErrorDescriptor>>,
}

#[derive(Default)]
struct JobTable {
    next_id: u64,
    jobs: HashMap<JobId, JobEntry>,
    /// Finished waitable jobs nobody has waited on yet.
    finished: VecDeque<JobId>,
    waiters: VecDeque<Waiter>,
}

impl JobTable {
    fn running_waitable(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.waitable && job.result.is_none())
            .count()
    }

    /// Forget waiters whose request was abandoned.
    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }

    /// Fail the newest wait-any requests that no running job is left to
    /// satisfy.
    fn release_excess_waiters(&mut self) {
        while self.waiters.len() > self.running_waitable() {
            let Some(pos) = self.waiters.iter().rposition(|w| w.id == JOBID_ANY) else {
                break;
            };
            if let Some(waiter) = self.waiters.remove(pos) {
                let _ = waiter.tx.send(Err(no_waitable()));
            }
        }
    }

    /// Remove and return a finished job's result.
    fn reap(&mut self, id: JobId) -> Option<WaitResponse> {
        let result = self.jobs.remove(&id)?.result;
        self.finished.retain(|finished| *finished != id);
        result
    }
}

/// In-memory job manager.
#[derive(Clone)]
pub struct JobManager {
    table: Arc<Mutex<JobTable>>,
    default_duration: Duration,
}

impl JobManager {
    /// Jobs without an explicit duration run for `default_duration`.
    pub fn new(default_duration: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(JobTable {
                next_id: 1,
                ..JobTable::default()
            })),
            default_duration,
        }
    }

    /// Number of jobs submitted and not yet reaped.
    pub fn active(&self) -> usize {
        self.table.lock().unwrap().jobs.len()
    }

    /// Handle a `job-manager.submit` request.
    pub async fn submit(&self, request: Request) -> Reply {
        let req: SubmitRequest = parse(&request)?;
        if req.jobspec.trim().is_empty() {
            return Err(ErrorDescriptor::with_message(errno::EINVAL, "jobspec is empty"));
        }
        let jobspec: JobSpec = serde_json::from_str(&req.jobspec).map_err(|e| {
            ErrorDescriptor::with_message(errno::EPROTO, format!("invalid jobspec: {e}"))
        })?;
        let Some(command) = jobspec
            .tasks
            .first()
            .map(|task| task.command.clone())
            .filter(|command| !command.is_empty())
        else {
            return Err(ErrorDescriptor::with_message(
                errno::EINVAL,
                "jobspec has no command",
            ));
        };

        let flags = JobFlags::from_bits_truncate(req.flags);
        let duration = jobspec
            .attributes
            .system
            .duration_ms
            .map_or(self.default_duration, Duration::from_millis);

        let id = {
            let mut table = self.table.lock().unwrap();
            let id = JobId::new(table.next_id);
            table.next_id += 1;
            table.jobs.insert(
                id,
                JobEntry {
                    waitable: flags.contains(JobFlags::WAITABLE),
                    result: None,
                },
            );
            id
        };

        tracing::info!(jobid = %id, command = ?command, ?duration, "Job started");

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let exits_nonzero = command[0].rsplit('/').next() == Some("false");
            let errstr = exits_nonzero.then(|| "task(s) exited with exit code 1".to_string());
            manager.finish(id, !exits_nonzero, errstr);
        });

        encode(&SubmitResponse { id })
    }

    fn finish(&self, id: JobId, success: bool, errstr: Option<String>) {
        let result = WaitResponse {
            id,
            success,
            errstr,
        };
        tracing::info!(jobid = %id, success, "Job finished");

        let mut table = self.table.lock().unwrap();
        let Some(job) = table.jobs.get_mut(&id) else {
            return;
        };
        if !job.waitable {
            table.jobs.remove(&id);
            return;
        }
        job.result = Some(result.clone());
        table.prune_waiters();

        // Someone waiting for this job by id is served before wait-any.
        let mut result = Some(result);
        while let Some(pos) = table
            .waiters
            .iter()
            .position(|w| w.id == id.as_u64())
            .or_else(|| table.waiters.iter().position(|w| w.id == JOBID_ANY))
        {
            let Some(waiter) = table.waiters.remove(pos) else {
                break;
            };
            let Some(pending) = result.take() else {
                break;
            };
            match waiter.tx.send(Ok(pending)) {
                Ok(()) => {
                    table.jobs.remove(&id);
                    table.release_excess_waiters();
                    return;
                }
                // The waiter went away; offer the result to the next one.
                Err(unclaimed) => result = unclaimed.ok(),
            }
        }
        table.finished.push_back(id);
    }

    /// Handle a `job-manager.wait` request.
    pub async fn wait(&self, request: Request) -> Reply {
        let req: WaitRequest = parse(&request)?;

        let rx = {
            let mut table = self.table.lock().unwrap();
            table.prune_waiters();
            if req.id == JOBID_ANY {
                if let Some(id) = table.finished.front().copied() {
                    let result = table.reap(id);
                    return result.map_or_else(|| Err(no_waitable()), |r| encode(&r));
                }
                if table.running_waitable() <= table.waiters.len() {
                    return Err(no_waitable());
                }
            } else {
                let id = JobId::new(req.id);
                let Some(job) = table.jobs.get(&id) else {
                    return Err(ErrorDescriptor::with_message(
                        errno::ENOENT,
                        format!("job {id} not found"),
                    ));
                };
                if !job.waitable {
                    return Err(ErrorDescriptor::with_message(
                        errno::EINVAL,
                        format!("job {id} was not submitted with the waitable flag"),
                    ));
                }
                if job.result.is_some() {
                    let result = table.reap(id);
                    return result.map_or_else(|| Err(no_waitable()), |r| encode(&r));
                }
            }

            let (tx, rx) = oneshot::channel();
            table.waiters.push_back(Waiter { id: req.id, tx });
            rx
        };

        match rx.await {
            Ok(Ok(result)) => encode(&result),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ErrorDescriptor::with_message(
                errno::ECHILD,
                "job manager shut down",
            )),
        }
    }
}

fn no_waitable() -> ErrorDescriptor {
    ErrorDescriptor::with_message(errno::ECHILD, "there are no waitable jobs")
}

fn parse<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, ErrorDescriptor> {
    let body = request
        .payload
        .as_deref()
        .ok_or_else(|| ErrorDescriptor::with_message(errno::EPROTO, "missing request payload"))?;
    serde_json::from_slice(body).map_err(|e| {
        ErrorDescriptor::with_message(errno::EPROTO, format!("malformed request: {e}"))
    })
}

fn encode<T: Serialize>(value: &T) -> Reply {
    serde_json::to_vec(value)
        .map(Some)
        .map_err(|e| ErrorDescriptor::with_message(errno::EPROTO, e.to_string()))
}

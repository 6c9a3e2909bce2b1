//! Test utilities and broker harness for tether tests.
//!
//! Provides:
//! - In-process broker setup with a connected handle
//! - Condition polling with timeout

#![allow(dead_code)]

use std::time::Duration;

use tether::service::{Broker, JobManager};
use tether::transport;
use tether::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A broker running in a background task, with a handle connected to it.
pub struct TestBroker {
    pub handle: Handle,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestBroker {
    /// Start `broker` and connect a fresh handle to it.
    pub fn start(broker: Broker) -> Self {
        tether::observability::tracing::init_test_tracing();

        let (transport, inbox) = transport::channel();
        let handle = Handle::new(transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(broker.serve(inbox, handle.downgrade(), shutdown_rx));

        Self {
            handle,
            shutdown_tx,
            task,
        }
    }

    /// Start a broker serving only the simulated job manager.
    pub fn with_jobs(default_duration: Duration) -> Self {
        Self::start(Broker::new().with_job_manager(JobManager::new(default_duration)))
    }

    /// Stop the broker and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met, `false` if the timeout expired.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

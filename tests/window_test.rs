//! Sliding-window runs against the simulated job manager.
//!
//! Tests:
//! - Concurrency never exceeds the window and every job is waited on once
//! - A window larger than the job count behaves like a window of one
//! - A zero-sized window is rejected before anything is submitted
//! - Losing the connection mid-run still accounts for every item

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, TestBroker};
use serde_json::json;
use tether::error::errno;
use tether::job::{JobFlags, JobId, JobSpec, JobWorkload};
use tether::service::{Broker, JobManager, Reply};
use tether::transport::Request;
use tether::window::{RpcWorkload, SlidingWindow, WindowConfig, WindowEvent};
use tether::{Error, RpcRequest};

fn jobspec(command: &str, duration_ms: u64) -> String {
    JobSpec::command([command])
        .duration_ms(duration_ms)
        .to_text()
        .expect("jobspec encodes")
}

/// Events seen by the observer, in order.
#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Submit(JobId),
    Wait(JobId, Option<String>),
}

#[tokio::test]
async fn test_window_bounds_concurrency() {
    let broker = TestBroker::with_jobs(Duration::from_millis(10));
    let mut workload = JobWorkload::new(
        broker.handle.clone(),
        jobspec("/bin/true", 10),
        JobFlags::empty(),
    );
    let mut window = SlidingWindow::new(WindowConfig::new(10, 2).unwrap());
    let mut seen = Vec::new();

    let report = window
        .run(&mut workload, |event| match event {
            WindowEvent::Admitted { id, in_flight } => {
                assert!(in_flight <= 2, "in_flight {in_flight} exceeds window");
                seen.push(Seen::Submit(*id));
            }
            WindowEvent::Completed {
                completion,
                in_flight,
            } => {
                assert!(in_flight < 2);
                seen.push(Seen::Wait(completion.id, completion.error.clone()));
            }
        })
        .await
        .expect("window run failed");

    assert_eq!(report.submitted, 10);
    assert_eq!(report.completed, 10);
    assert_eq!(report.succeeded, 10);
    assert_eq!(report.peak_in_flight, 2);

    let submitted: HashSet<JobId> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::Submit(id) => Some(*id),
            Seen::Wait(..) => None,
        })
        .collect();
    let waited: Vec<JobId> = seen
        .iter()
        .filter_map(|s| match s {
            Seen::Wait(id, None) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(submitted.len(), 10, "job ids must be distinct");
    assert_eq!(waited.len(), 10);
    assert_eq!(waited.iter().copied().collect::<HashSet<_>>(), submitted);
    assert_eq!(workload.outstanding(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_single_job_ignores_oversized_window() {
    for capacity in [5, 1] {
        let broker = TestBroker::with_jobs(Duration::from_millis(5));
        let mut workload = JobWorkload::new(
            broker.handle.clone(),
            jobspec("/bin/true", 5),
            JobFlags::WAITABLE,
        );
        let mut window = SlidingWindow::new(WindowConfig::new(1, capacity).unwrap());
        let mut seen = Vec::new();

        let report = window
            .run(&mut workload, |event| match event {
                WindowEvent::Admitted { id, .. } => seen.push(Seen::Submit(*id)),
                WindowEvent::Completed { completion, .. } => {
                    seen.push(Seen::Wait(completion.id, completion.error.clone()));
                }
            })
            .await
            .unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.peak_in_flight, 1);
        assert_eq!(seen.len(), 2, "capacity {capacity}: {seen:?}");
        let Seen::Submit(id) = seen[0] else {
            panic!("first event must be a submit: {seen:?}");
        };
        assert_eq!(seen[1], Seen::Wait(id, None));

        broker.shutdown().await;
    }
}

#[tokio::test]
async fn test_zero_window_submits_nothing() {
    let jobs = JobManager::new(Duration::from_millis(5));
    let broker = TestBroker::start(Broker::new().with_job_manager(jobs.clone()));

    let err = WindowConfig::new(3, 0).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(jobs.active(), 0);
    assert_eq!(broker.handle.pending(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_failed_jobs_are_reported_not_retried() {
    let broker = TestBroker::with_jobs(Duration::from_millis(5));
    let mut workload = JobWorkload::new(
        broker.handle.clone(),
        jobspec("/bin/false", 5),
        JobFlags::empty(),
    );
    let mut window = SlidingWindow::new(WindowConfig::new(4, 2).unwrap());

    let report = window.run(&mut workload, |_| {}).await.unwrap();
    assert_eq!(report.submitted, 4);
    assert_eq!(report.completed, 4);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failures.len(), 4);
    for failure in &report.failures {
        assert_eq!(
            failure.error.as_deref(),
            Some("task(s) exited with exit code 1")
        );
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn test_sever_mid_run_fails_outstanding_jobs() {
    // Jobs outlive the test, so only the severed connection can end them.
    let broker = TestBroker::with_jobs(Duration::from_secs(60));
    let handle = broker.handle.clone();
    let mut workload = JobWorkload::new(
        handle.clone(),
        jobspec("/bin/true", 60_000),
        JobFlags::empty(),
    );
    let mut window = SlidingWindow::new(WindowConfig::new(3, 3).unwrap());

    let all_admitted = Arc::new(AtomicBool::new(false));
    let severer = {
        let all_admitted = all_admitted.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            // Once everything is admitted, the only request in flight is the wait.
            let ready = wait_for(Duration::from_secs(5), || {
                all_admitted.load(Ordering::SeqCst) && handle.pending() == 1
            })
            .await;
            handle.sever("interrupted");
            ready
        })
    };

    let report = window
        .run(&mut workload, |event| {
            if let WindowEvent::Admitted { in_flight: 3, .. } = event {
                all_admitted.store(true, Ordering::SeqCst);
            }
        })
        .await
        .expect("window run failed");
    assert!(severer.await.unwrap(), "window never started waiting");

    assert_eq!(report.submitted, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(report.failures.len(), 3);
    assert_eq!(report.failures[0].error.as_deref(), Some("local fault: interrupted"));
    assert_eq!(workload.outstanding(), 0);
    assert_eq!(handle.pending(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_rpc_workload_sever_completes_every_item() {
    let broker = TestBroker::start(Broker::new().route("test.silent", |_req: Request| {
        futures::future::pending::<Reply>()
    }));
    let handle = broker.handle.clone();
    let mut workload = RpcWorkload::new(handle.clone(), |i| {
        RpcRequest::new("test.silent").payload(json!({ "item": i }))
    });
    let mut window = SlidingWindow::new(WindowConfig::new(4, 4).unwrap());

    let severer = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let ready = wait_for(Duration::from_secs(5), || handle.pending() == 4).await;
            handle.sever("link lost");
            ready
        })
    };

    let report = window.run(&mut workload, |_| {}).await.unwrap();
    assert!(severer.await.unwrap());

    assert_eq!(report.completed, 4);
    assert_eq!(report.failures.len(), 4);
    let mut ids: Vec<u64> = report.failures.iter().map(|f| f.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(workload.outstanding(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_rpc_workload_refills_on_first_completion() {
    // Item 0 is slow, the rest are fast; the window keeps moving around it.
    let broker = TestBroker::start(Broker::new().route("test.sleep", |req: Request| async move {
        let ms: u64 = serde_json::from_slice(req.payload.as_deref().unwrap_or(b"0")).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(req.payload)
    }));
    let mut workload = RpcWorkload::new(broker.handle.clone(), |i| {
        let ms = if i == 0 { 300 } else { 5 };
        RpcRequest::new("test.sleep").payload(json!(ms))
    });
    let mut window = SlidingWindow::new(WindowConfig::new(5, 2).unwrap());
    let mut completed = Vec::new();

    let report = window
        .run(&mut workload, |event| {
            if let WindowEvent::Completed { completion, .. } = event {
                completed.push(completion.id);
            }
        })
        .await
        .unwrap();

    assert_eq!(report.succeeded, 5);
    assert_eq!(completed.last(), Some(&0));
    assert_eq!(completed[..4], [1, 2, 3, 4]);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_remote_errors_become_failed_completions() {
    let broker = TestBroker::start(Broker::new());
    let mut workload = RpcWorkload::new(broker.handle.clone(), |_| RpcRequest::new("test.absent"));
    let mut window = SlidingWindow::new(WindowConfig::new(2, 1).unwrap());

    let report = window.run(&mut workload, |_| {}).await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(report.failures.len(), 2);
    let expected = format!(
        "remote error: {}",
        std::io::Error::from_raw_os_error(errno::ENOSYS)
    );
    assert_eq!(report.failures[0].error.as_deref(), Some(expected.as_str()));

    broker.shutdown().await;
}

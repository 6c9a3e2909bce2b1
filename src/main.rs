//! Tether driver: run N jobs, keeping at most `fanout` outstanding.
//!
//! # Usage
//!
//! ```bash
//! tether --jobs 10 --fanout 2 --command /bin/true
//! ```
//!
//! Environment variables can also be used:
//! - `TETHER_JOBS`: Number of jobs to run
//! - `TETHER_FANOUT`: Maximum outstanding jobs
//! - `RUST_LOG`: Log filter (overrides `--log-level`)

use std::time::Duration;

use anyhow::Context;
use tether::config::Config;
use tether::job::{JobFlags, JobSpec, JobWorkload};
use tether::observability::metrics::init_metrics_with_endpoint;
use tether::observability::tracing::init_tracing;
use tether::service::{Broker, JobManager};
use tether::transport;
use tether::window::{SlidingWindow, WindowEvent};
use tether::Handle;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    // Reject a bad window before anything is started
    let window_config = config.window()?;

    init_tracing(&config.log_level);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    // Open a connection to an in-process job manager
    let (transport, inbox) = transport::channel();
    let handle = Handle::new(transport);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker = Broker::new().with_job_manager(JobManager::new(Duration::from_millis(
        config.duration_ms,
    )));
    let broker_task = tokio::spawn(broker.serve(inbox, handle.downgrade(), shutdown_rx));

    // Ctrl+C severs the connection so outstanding jobs fault instead of hanging
    let interrupt = handle.downgrade();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT (Ctrl+C), severing connection...");
            if let Some(handle) = interrupt.upgrade() {
                handle.sever("interrupted");
            }
        }
    });

    let jobspec = JobSpec::command(config.command.split_whitespace())
        .duration_ms(config.duration_ms)
        .to_text()?;
    let mut workload = JobWorkload::new(handle.clone(), jobspec, JobFlags::WAITABLE);
    let mut window = SlidingWindow::new(window_config);

    let report = window
        .run(&mut workload, |event| match event {
            WindowEvent::Admitted { id, .. } => println!("submit: {id}"),
            WindowEvent::Completed { completion, .. } => match &completion.error {
                None => println!("wait: {} Success", completion.id),
                Some(error) => println!("wait: {} Error: {error}", completion.id),
            },
        })
        .await
        .context("sliding window aborted")?;

    tracing::info!(
        completed = report.completed,
        failed = report.failures.len(),
        peak_in_flight = report.peak_in_flight,
        "All jobs complete"
    );

    handle.close();
    let _ = shutdown_tx.send(true);
    broker_task.await.context("broker task panicked")?;
    Ok(())
}

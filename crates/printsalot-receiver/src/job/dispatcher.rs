//! Job dispatcher: one task per print job, exactly one status per job.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::content::{ContentResolver, ResolveError};
use crate::printer::{PrinterSink, SinkError};
use crate::relay::RelayHandle;
use crate::relay::protocol::{FailureReason, JobStatus, PrintJob};

/// Where terminal job statuses go.
pub trait StatusReporter: Clone + Send + Sync + 'static {
    fn report(&self, job_id: &str, status: JobStatus) -> impl Future<Output = ()> + Send;
}

impl StatusReporter for RelayHandle {
    async fn report(&self, job_id: &str, status: JobStatus) {
        self.emit_status(job_id, status).await;
    }
}

/// Why a job did not print.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Print task failed: {0}")]
    Task(String),
}

impl JobError {
    /// Reason reported to the relay.
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::Sink(SinkError::PaperOrOffline(_)) => FailureReason::OutOfPaper,
            _ => FailureReason::Error,
        }
    }
}

#[derive(Clone)]
pub struct JobDispatcher<R> {
    resolver: ContentResolver,
    sink: Arc<PrinterSink>,
    reporter: R,
}

impl<R: StatusReporter> JobDispatcher<R> {
    pub const fn new(resolver: ContentResolver, sink: Arc<PrinterSink>, reporter: R) -> Self {
        Self {
            resolver,
            sink,
            reporter,
        }
    }

    /// Process jobs until the channel closes, each on its own task, then wait
    /// for the jobs still in flight.
    pub async fn run(self, mut jobs: mpsc::UnboundedReceiver<PrintJob>) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    let this = self.clone();
                    in_flight.spawn(async move {
                        this.handle(job).await;
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Print job task panicked");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "Waiting for in-flight print jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Print job task panicked");
            }
        }
        debug!("Job dispatcher stopped");
    }

    /// Print one job and report its outcome. Returns the reported status.
    pub async fn handle(&self, job: PrintJob) -> JobStatus {
        info!(job_id = %job.job_id, auto_cut = job.auto_cut, "Processing print job");
        let status = match self.print(&job).await {
            Ok(()) => {
                info!(job_id = %job.job_id, "Print job completed");
                JobStatus::Completed
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Print job failed");
                JobStatus::Failed(e.reason())
            }
        };
        self.reporter.report(&job.job_id, status).await;
        status
    }

    async fn print(&self, job: &PrintJob) -> Result<(), JobError> {
        let resolved = self.resolver.resolve(&job.content).await?;
        debug!(
            job_id = %job.job_id,
            source = ?resolved.source,
            width = resolved.image.width(),
            height = resolved.image.height(),
            "Job image ready"
        );
        let sink = Arc::clone(&self.sink);
        let auto_cut = job.auto_cut;
        tokio::task::spawn_blocking(move || sink.print(&resolved.image, auto_cut))
            .await
            .map_err(|e| JobError::Task(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

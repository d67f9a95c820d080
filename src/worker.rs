//! The worker-side client of the work queue server.
//!
//! Each worker process runs one of these: request work over the local
//! socket, wait for a locked job, run the body, report the outcome. The
//! body itself is a black box behind `JobRunner`; the worker only observes
//! success, a retryable error, or a fatal error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::protocol::{self, ProtocolError, WorkRequest, WorkerConfig};
use crate::hooks::{Callbacks, Event};
use crate::job::Job;
use crate::settings::Settings;
use crate::store::{JobStore, RescheduleOutcome, StoreError};

/// What running a job body produced. `Error` is retryable up to the attempt
/// cap; `Fatal` moves the job to the failed set immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Error(String),
    Fatal(String),
}

/// The job body invocation. Payload decoding and exception handling happen
/// behind this trait.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn perform(&self, job: &Job) -> JobOutcome;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error talking to the work queue server: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting to the work queue server")]
    ConnectTimeout,
    #[error("work queue server closed the connection")]
    Disconnected,
}

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct Worker {
    name: String,
    config: WorkerConfig,
    store: JobStore,
    settings: Arc<Settings>,
    hooks: Arc<Callbacks>,
    runner: Arc<dyn JobRunner>,
    /// Reused across request cycles; dropped and re-opened on any error.
    conn: Option<Framed<UnixStream, LengthDelimitedCodec>>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        config: WorkerConfig,
        store: JobStore,
        hooks: Arc<Callbacks>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let settings = store.settings_arc();
        Self {
            name: name.into(),
            config,
            store,
            settings,
            hooks,
            runner,
            conn: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until cancelled. Per-job failures never abort the loop; socket
    /// errors reconnect. Any lock still attributed to this worker is
    /// cleared on the way out.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.hooks.fire(&Event::Execute { worker: &self.name });
        let result = self.work_loop(&shutdown).await;
        if let Err(err) = &result {
            let message = err.to_string();
            self.hooks.fire(&Event::ExceptionalExit {
                worker: &self.name,
                error: &message,
            });
        }
        if let Err(err) = self.store.clear_locks(&self.name).await {
            warn!(worker = %self.name, error = %err, "failed to clear locks on shutdown");
        }
        result
    }

    async fn work_loop(&mut self, shutdown: &CancellationToken) -> Result<(), WorkerError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.hooks.fire(&Event::Loop { worker: &self.name });

            let popped = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                popped = self.pop() => popped,
            };
            match popped {
                Ok(job) => self.perform(job).await,
                Err(err) => {
                    debug!(worker = %self.name, error = %err, "pop failed, reconnecting");
                    self.conn = None;
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    /// One request/response cycle against the work queue server. Blocks
    /// until the server assigns a job.
    async fn pop(&mut self) -> Result<Job, WorkerError> {
        self.hooks.fire(&Event::Pop { worker: &self.name });

        if self.conn.is_none() {
            let timeout =
                Duration::from_secs_f64(self.settings.parent_process.client_connect_timeout);
            let stream = tokio::time::timeout(
                timeout,
                UnixStream::connect(&self.settings.parent_process.server_address),
            )
            .await
            .map_err(|_| WorkerError::ConnectTimeout)??;
            self.conn = Some(Framed::new(stream, protocol::codec()));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(WorkerError::Disconnected);
        };

        let request = WorkRequest {
            worker_name: self.name.clone(),
            config: self.config.clone(),
        };
        conn.send(protocol::encode(&request)?).await?;

        let frame = conn.next().await.ok_or(WorkerError::Disconnected)??;
        let job: Job = protocol::decode(&frame)?;
        debug!(worker = %self.name, job_id = job.id, "received job");
        Ok(job)
    }

    async fn perform(&self, job: Job) {
        let event = Event::Perform {
            worker: &self.name,
            job: &job,
        };
        let mut outcome: Option<JobOutcome> = None;
        {
            let outcome = &mut outcome;
            let job = &job;
            let hooks = &self.hooks;
            let runner = &self.runner;
            self.hooks
                .wrap(
                    &event,
                    Box::pin(async move {
                        hooks.fire(&Event::InvokeJob { job });
                        *outcome = Some(runner.perform(job).await);
                    }),
                )
                .await;
        }
        let Some(outcome) = outcome else { return };
        if let Err(err) = self.report(&job, outcome).await {
            warn!(worker = %self.name, job_id = job.id, error = %err, "failed to report outcome");
        }
    }

    async fn report(&self, job: &Job, outcome: JobOutcome) -> Result<(), StoreError> {
        match outcome {
            JobOutcome::Success => {
                self.store.delete(job.id).await?;
                debug!(worker = %self.name, job_id = job.id, "job completed");
            }
            JobOutcome::Error(message) => match self.store.reschedule(job, Some(&message)).await? {
                RescheduleOutcome::Rescheduled { run_at } => {
                    self.hooks.fire(&Event::Retry {
                        worker: &self.name,
                        job,
                        error: &message,
                    });
                    debug!(
                        worker = %self.name,
                        job_id = job.id,
                        %run_at,
                        "job failed, rescheduled"
                    );
                }
                RescheduleOutcome::Failed(_) => {
                    self.hooks.fire(&Event::Error {
                        worker: &self.name,
                        job,
                        error: &message,
                    });
                    warn!(worker = %self.name, job_id = job.id, "job failed permanently");
                }
            },
            JobOutcome::Fatal(message) => {
                self.store.fail_job(job.id, Some(&message)).await?;
                self.hooks.fire(&Event::Error {
                    worker: &self.name,
                    job,
                    error: &message,
                });
                warn!(worker = %self.name, job_id = job.id, "job failed fatally");
            }
        }
        Ok(())
    }
}

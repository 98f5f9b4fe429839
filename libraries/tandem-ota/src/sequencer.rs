//! Job Sequencer
//!
//! Single-slot job queue plus the worker task that executes it. The slot
//! holds the job while it runs (peek, not pop), so an abort request can
//! see what is in flight; the worker frees it when the job is done.
//!
//! AI-model submissions wait for the job's verdict. Firmware submissions
//! return once queued and report through the event bus.

use crate::config::EngineConfig;
use crate::events::{EventBus, OtaEvent, StatusReporter};
use crate::runner::JobRunner;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tandem_core::{ArtifactKind, JobId, OtaError, OtaJob, Result};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Slot {
    job: OtaJob,
    cancel: CancellationToken,
    verdict: Option<oneshot::Sender<Result<()>>>,
}

struct Shared {
    slot: Mutex<Option<Slot>>,
    wake: Notify,
    head: watch::Sender<Option<JobId>>,
    network: watch::Receiver<bool>,
    bus: EventBus,
    config: Arc<EngineConfig>,
    shutdown: CancellationToken,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the sequencer; clones share the same queue
#[derive(Clone)]
pub struct JobSequencer {
    shared: Arc<Shared>,
}

impl JobSequencer {
    /// Spawn the worker task
    pub fn spawn(
        runner: Arc<dyn JobRunner>,
        network: watch::Receiver<bool>,
        bus: EventBus,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (head, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            wake: Notify::new(),
            head,
            network,
            bus,
            config,
            shutdown,
        });

        let worker = Worker {
            shared: shared.clone(),
            runner,
        };
        let handle = tokio::spawn(worker.run());

        (Self { shared }, handle)
    }

    /// Queue `job`.
    ///
    /// Fails with [`OtaError::AlreadyRunning`] while another job occupies the
    /// slot. For [`ArtifactKind::AiModel`] this waits for the job's verdict.
    pub async fn submit(&self, job: OtaJob) -> Result<()> {
        let waits = job.kind == ArtifactKind::AiModel;
        let (verdict, answer) = if waits {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        {
            let mut slot = self.shared.slot();
            if let Some(current) = slot.as_ref() {
                warn!(
                    kind = ?job.kind,
                    running = ?current.job.kind,
                    "Rejecting job, another update is in progress"
                );
                return Err(OtaError::AlreadyRunning);
            }
            if self.shared.shutdown.is_cancelled() {
                return Err(OtaError::EngineStopped);
            }

            info!(job_id = %job.id, kind = ?job.kind, url = %job.url, "Job queued");
            self.shared.head.send_replace(Some(job.id.clone()));
            *slot = Some(Slot {
                job,
                cancel: self.shared.shutdown.child_token(),
                verdict,
            });
        }
        self.shared.wake.notify_one();

        match answer {
            Some(answer) => answer.await.unwrap_or(Err(OtaError::EngineStopped)),
            None => Ok(()),
        }
    }

    /// Cancel the queued job if its kind matches (`None` matches any).
    ///
    /// Waits up to the teardown window for the worker to free the slot.
    /// Returns `false` when nothing matched.
    pub async fn abort(&self, kind: Option<ArtifactKind>) -> Result<bool> {
        let target = {
            let slot = self.shared.slot();
            match slot.as_ref() {
                Some(current) if kind.map_or(true, |k| k == current.job.kind) => {
                    current.cancel.cancel();
                    Some(current.job.id.clone())
                }
                _ => None,
            }
        };

        let Some(id) = target else {
            debug!(kind = ?kind, "Abort requested but no matching job");
            return Ok(false);
        };

        info!(job_id = %id, "Abort requested, waiting for the worker");
        let mut head = self.shared.head.subscribe();
        let released = async move {
            head.wait_for(|current| current.as_ref() != Some(&id))
                .await
                .map(|_| ())
        };

        match tokio::time::timeout(self.shared.config.cancel_teardown(), released).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(OtaError::EngineStopped),
            Err(_) => {
                warn!("Worker did not release the job within the teardown window");
                Err(OtaError::Timeout)
            }
        }
    }

    /// The job currently occupying the slot
    pub fn current(&self) -> Option<OtaJob> {
        self.shared.slot().as_ref().map(|slot| slot.job.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.shared.slot().is_some()
    }

    /// Watch the ID of the job occupying the slot
    pub fn subscribe(&self) -> watch::Receiver<Option<JobId>> {
        self.shared.head.subscribe()
    }
}

impl std::fmt::Debug for JobSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSequencer")
            .field("busy", &self.is_busy())
            .finish()
    }
}

struct Worker {
    shared: Arc<Shared>,
    runner: Arc<dyn JobRunner>,
}

impl Worker {
    async fn run(self) {
        info!("Job worker started");

        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }

            let head = self
                .shared
                .slot()
                .as_ref()
                .map(|slot| (slot.job.clone(), slot.cancel.clone()));

            match head {
                Some((job, cancel)) => self.execute(&job, cancel).await,
                None => tokio::select! {
                    _ = self.shared.shutdown.cancelled() => break,
                    _ = self.shared.wake.notified() => {}
                },
            }
        }

        // Nobody will run a job left in the slot
        if let Some(slot) = self.shared.slot().take() {
            if let Some(verdict) = slot.verdict {
                let _ = verdict.send(Err(OtaError::EngineStopped));
            }
        }
        self.shared.head.send_replace(None);
        info!("Job worker stopped");
    }

    async fn execute(&self, job: &OtaJob, cancel: CancellationToken) {
        let bus = &self.shared.bus;
        let reporter = StatusReporter::new(bus.clone(), job.kind);

        let result = match self.wait_for_network(&cancel).await {
            Ok(()) => {
                info!(job_id = %job.id, kind = ?job.kind, "Job started");
                bus.publish(OtaEvent::JobStarted {
                    job_id: job.id.clone(),
                    kind: job.kind,
                });
                self.run_watched(job, cancel, reporter.clone()).await
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => info!(job_id = %job.id, kind = ?job.kind, "Job succeeded"),
            Err(OtaError::VersionTooOld) => {
                info!(job_id = %job.id, kind = ?job.kind, "Job skipped, already up to date");
            }
            Err(err) => warn!(job_id = %job.id, kind = ?job.kind, error = %err, "Job failed"),
        }

        // Free the slot before the terminal record goes out, so an observer
        // reacting to it can queue the next job right away.
        let slot = self.shared.slot().take();
        self.shared.head.send_replace(None);

        reporter.finish(&result);
        bus.publish(OtaEvent::JobFinished {
            job_id: job.id.clone(),
            kind: job.kind,
            error: result.as_ref().err().copied(),
        });

        if let Some(verdict) = slot.and_then(|slot| slot.verdict) {
            let _ = verdict.send(result);
        }
    }

    async fn wait_for_network(&self, cancel: &CancellationToken) -> Result<()> {
        let mut network = self.shared.network.clone();
        let recheck = self.shared.config.network_recheck();

        loop {
            if cancel.is_cancelled() {
                return Err(OtaError::UserCanceled);
            }
            if *network.borrow_and_update() {
                return Ok(());
            }

            debug!("Network unavailable, job waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(OtaError::UserCanceled),
                changed = network.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(recheck).await;
                    }
                }
                _ = tokio::time::sleep(recheck) => {}
            }
        }
    }

    /// Run the flow, canceling it if the network goes away mid-job
    async fn run_watched(
        &self,
        job: &OtaJob,
        cancel: CancellationToken,
        reporter: StatusReporter,
    ) -> Result<()> {
        let flow = self.runner.run(job, cancel.clone(), reporter);
        tokio::pin!(flow);

        let lost = network_lost(self.shared.network.clone());
        tokio::pin!(lost);

        let mut offline = false;
        let result = loop {
            tokio::select! {
                result = &mut flow => break result,
                () = &mut lost, if !offline => {
                    warn!(job_id = %job.id, kind = ?job.kind, "Network lost, canceling job");
                    offline = true;
                    cancel.cancel();
                }
            }
        };

        match result {
            Err(_) if offline => Err(OtaError::ConnectionFail),
            other => other,
        }
    }
}

/// Resolves once the network is reported down
async fn network_lost(mut network: watch::Receiver<bool>) {
    loop {
        if !*network.borrow_and_update() {
            return;
        }
        if network.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

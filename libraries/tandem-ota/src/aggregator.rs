//! Dual-Stage Status Aggregator
//!
//! Turns a remote update manifest into an ordered sequence of jobs and
//! folds their per-artifact status into one combined 0-100% report.
//!
//! ```text
//! Idle -> Validating -> (Requesting -> AwaitingStatus)* -> Complete
//!              \                 \                   \
//!               +-----------------+-------------------+-> Failed
//! ```
//!
//! The companion stage always runs before the main stage: restarting into
//! new main firmware must not interrupt a companion flash. Each stage has a
//! watchdog budget that is re-armed by every status update; when it runs
//! out, the stage is force-canceled once and the sequence fails with
//! [`OtaError::Timeout`].

use crate::bridge::WorkerBridge;
use crate::companion::CompanionDevice;
use crate::config::EngineConfig;
use crate::events::{EventBus, EventStream, OtaEvent};
use crate::sequencer::JobSequencer;
use crate::system::SystemControl;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::{
    ArtifactKind, OtaError, OtaJob, ReportKind, Result, StatusKind, UpdateManifest, UpdateReport,
    VersionGate, VersionOrdering,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Aggregator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Validating,
    /// Submitting the next stage's job
    Requesting,
    /// Waiting for the running stage to report
    AwaitingStatus,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stage {
    kind: ArtifactKind,
    url: String,
    size: Option<u64>,
}

impl Stage {
    fn job(&self) -> OtaJob {
        let job = OtaJob::new(self.kind, self.url.clone());
        match self.size {
            Some(size) => job.with_expected_size(size),
            None => job,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Installed,
    UpToDate,
}

/// Dependencies of the aggregator
pub struct AggregatorParts {
    pub sequencer: JobSequencer,
    pub bridge: WorkerBridge,
    pub companion: Arc<dyn CompanionDevice>,
    pub gate: Arc<VersionGate>,
    pub bus: EventBus,
    pub system: Arc<dyn SystemControl>,
    pub config: Arc<EngineConfig>,
}

struct Inner {
    parts: AggregatorParts,
    running: AtomicBool,
    state: watch::Sender<AggregatorState>,
}

/// Runs manifest-driven and forced updates; clones share one instance
#[derive(Clone)]
pub struct StatusAggregator {
    inner: Arc<Inner>,
}

/// Clears the running flag when a sequence ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Non-decreasing combined percentage
struct CombinedProgress<'a> {
    bus: &'a EventBus,
    last: u8,
}

impl CombinedProgress<'_> {
    fn publish(&mut self, percent: u8) {
        if percent < self.last {
            return;
        }
        self.last = percent;
        self.bus.publish(OtaEvent::Report(UpdateReport::new(
            ReportKind::Upgrading,
            percent,
            None,
        )));
    }

    /// Map a stage-local percentage onto the combined scale
    fn stage(&mut self, index: usize, total: usize, percent: u8) {
        let combined = (index * 100 + usize::from(percent.min(100))) / total;
        self.publish(u8::try_from(combined).unwrap_or(100));
    }
}

impl StatusAggregator {
    pub fn new(parts: AggregatorParts) -> Self {
        let (state, _) = watch::channel(AggregatorState::Idle);
        Self {
            inner: Arc::new(Inner {
                parts,
                running: AtomicBool::new(false),
                state,
            }),
        }
    }

    pub fn state(&self) -> AggregatorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AggregatorState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<RunGuard<'_>> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Update sequence already running, rejecting request");
            return Err(OtaError::AlreadyRunning);
        }
        Ok(RunGuard(&self.inner.running))
    }

    fn set_state(&self, state: AggregatorState) {
        debug!(state = ?state, "Aggregator state");
        self.inner.state.send_replace(state);
    }

    fn report(&self, kind: ReportKind, percent: u8, error: Option<OtaError>) {
        self.inner
            .parts
            .bus
            .publish(OtaEvent::Report(UpdateReport::new(kind, percent, error)));
    }

    /// Validate `manifest`, pick the stale artifacts and install them.
    ///
    /// Returns once the sequence reached a terminal state; the outcome is
    /// also published as a [`UpdateReport`].
    pub async fn handle_manifest(&self, manifest: &UpdateManifest) -> Result<()> {
        let _running = self.acquire()?;

        self.set_state(AggregatorState::Validating);
        if let Err(err) = manifest.validate() {
            warn!(
                detail = manifest.validation_detail().as_deref().unwrap_or("unknown"),
                "Rejecting update manifest"
            );
            self.report(ReportKind::Failed, 0, Some(err));
            self.set_state(AggregatorState::Failed);
            return Err(err);
        }

        let stages = self.select_stages(manifest).await;
        if stages.is_empty() {
            info!("Every artifact in the manifest is already installed");
            self.report(ReportKind::UpToDate, 100, None);
            self.set_state(AggregatorState::Complete);
            return Ok(());
        }

        self.run_stages(&stages).await
    }

    /// Install `url` as `kind` without consulting the version gate.
    ///
    /// AI-model jobs return the job's own verdict. Firmware runs as a
    /// single-stage sequence so it gets the watchdog and the reboot.
    pub async fn force_update(&self, kind: ArtifactKind, url: &str) -> Result<()> {
        info!(kind = ?kind, url, "Forced update requested");

        if kind == ArtifactKind::AiModel {
            return self.inner.parts.sequencer.submit(OtaJob::new(kind, url)).await;
        }

        let _running = self.acquire()?;
        let _forced = self.inner.parts.gate.forced();

        let stages = [Stage {
            kind,
            url: url.to_string(),
            size: None,
        }];
        self.run_stages(&stages).await
    }

    /// Installed main and companion firmware versions, where readable
    pub async fn installed_versions(&self) -> (Option<String>, Option<String>) {
        let parts = &self.inner.parts;

        let main = match parts.bridge.running_descriptor().await {
            Ok(descriptor) => Some(descriptor.version),
            Err(e) => {
                warn!(error = %e, "Could not read the running main-firmware version");
                None
            }
        };
        let companion = match parts.companion.device_info().await {
            Ok(info) => Some(info.firmware_version),
            Err(e) => {
                warn!(error = %e, "Could not read the companion firmware version");
                None
            }
        };

        (main, companion)
    }

    async fn select_stages(&self, manifest: &UpdateManifest) -> Vec<Stage> {
        let parts = &self.inner.parts;
        let mut stages = Vec::new();

        for (kind, entry) in manifest.entries() {
            let installed = match kind {
                ArtifactKind::MainFirmware => parts
                    .bridge
                    .running_descriptor()
                    .await
                    .map(|descriptor| descriptor.version)
                    .map_err(|e| e.to_string()),
                _ => parts
                    .companion
                    .device_info()
                    .await
                    .map(|info| info.firmware_version)
                    .map_err(|e| e.to_string()),
            };

            let stale = match installed {
                Ok(installed) => {
                    let ordering = parts.gate.compare(&entry.version, &installed);
                    debug!(
                        kind = ?kind,
                        offered = %entry.version,
                        installed = %installed,
                        ordering = ?ordering,
                        "Version check"
                    );
                    ordering == VersionOrdering::Newer
                }
                Err(reason) => {
                    warn!(kind = ?kind, reason = %reason, "Installed version unknown, updating");
                    true
                }
            };

            if stale {
                stages.push(Stage {
                    kind,
                    url: entry.url.clone(),
                    size: entry.size,
                });
            }
        }

        stages
    }

    async fn run_stages(&self, stages: &[Stage]) -> Result<()> {
        let parts = &self.inner.parts;
        let total = stages.len();
        let mut combined = CombinedProgress {
            bus: &parts.bus,
            last: 0,
        };
        let mut installed = false;

        info!(stages = total, "Starting update sequence");
        combined.publish(0);

        for (index, stage) in stages.iter().enumerate() {
            self.set_state(AggregatorState::Requesting);

            // Subscribe first so no status of this stage is missed
            let mut events = parts.bus.subscribe();
            let job = stage.job();
            let outcome = match parts.sequencer.submit(job).await {
                Ok(()) => {
                    self.set_state(AggregatorState::AwaitingStatus);
                    self.await_stage(index, total, stage.kind, &mut events, &mut combined)
                        .await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(StageOutcome::Installed) => installed = true,
                Ok(StageOutcome::UpToDate) => {}
                Err(err) => {
                    error!(kind = ?stage.kind, error = %err, "Update stage failed");
                    self.report(ReportKind::Failed, combined.last, Some(err));
                    self.set_state(AggregatorState::Failed);
                    return Err(err);
                }
            }
        }

        self.set_state(AggregatorState::Complete);
        if installed {
            info!("Update sequence complete");
            self.report(ReportKind::Succeeded, 100, None);
            self.schedule_reboot();
        } else {
            info!("Update sequence found nothing newer");
            self.report(ReportKind::UpToDate, 100, None);
        }
        Ok(())
    }

    async fn await_stage(
        &self,
        index: usize,
        total: usize,
        kind: ArtifactKind,
        events: &mut EventStream,
        combined: &mut CombinedProgress<'_>,
    ) -> Result<StageOutcome> {
        let budget = self.inner.parts.config.stage_budget(kind);

        loop {
            let record = match tokio::time::timeout(budget, events.next_status(kind)).await {
                Ok(Some(record)) => record,
                Ok(None) => return Err(OtaError::EngineStopped),
                Err(_) => {
                    warn!(kind = ?kind, budget_secs = budget.as_secs(), "Stage stalled, canceling it");
                    if let Err(e) = self.inner.parts.sequencer.abort(Some(kind)).await {
                        warn!(kind = ?kind, error = %e, "Stalled stage did not stop cleanly");
                    }
                    return Err(OtaError::Timeout);
                }
            };

            match record.kind {
                StatusKind::Upgrading => combined.stage(index, total, record.percentage),
                StatusKind::Succeed | StatusKind::UpToDate => {
                    combined.stage(index, total, 100);
                    return Ok(if record.kind == StatusKind::Succeed {
                        StageOutcome::Installed
                    } else {
                        StageOutcome::UpToDate
                    });
                }
                StatusKind::Fail => {
                    return Err(record.error.unwrap_or(OtaError::FlasherInternalError));
                }
            }
        }
    }

    fn schedule_reboot(&self) {
        let parts = &self.inner.parts;
        let delay_ms = parts.config.stages.reboot_delay_ms;
        let delay = parts.config.reboot_delay();
        let system = parts.system.clone();

        info!(delay_ms, "Restart scheduled");
        parts.bus.publish(OtaEvent::RebootScheduled { delay_ms });

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            system.restart();
        });
    }
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusAggregator")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

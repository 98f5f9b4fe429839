//! Main-firmware self-update
//!
//! The main module updates its own inactive partition. Every partition
//! primitive goes through the [`WorkerBridge`], so this flow never touches
//! the OTA handle directly.

use crate::bridge::{OtaHandle, PerformStatus, WorkerBridge};
use crate::config::EngineConfig;
use crate::error::{CallError, PartitionError};
use crate::events::StatusReporter;
use crate::progress::Milestones;
use std::sync::Arc;
use tandem_core::{OtaError, OtaJob, Result, VersionGate, VersionOrdering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct MainFirmwareFlow {
    bridge: WorkerBridge,
    gate: Arc<VersionGate>,
    config: Arc<EngineConfig>,
}

impl MainFirmwareFlow {
    pub fn new(bridge: WorkerBridge, gate: Arc<VersionGate>, config: Arc<EngineConfig>) -> Self {
        Self {
            bridge,
            gate,
            config,
        }
    }

    pub async fn run(
        &self,
        job: &OtaJob,
        cancel: &CancellationToken,
        reporter: &StatusReporter,
    ) -> Result<()> {
        let handle = self.begin(job, cancel).await?;

        let result = self.install(handle, cancel, reporter).await;
        if result.is_err() {
            if let Err(e) = self.bridge.abort(handle).await {
                warn!(handle = handle.0, error = %e, "Failed to abort main-firmware update");
            }
        }
        result
    }

    async fn begin(&self, job: &OtaJob, cancel: &CancellationToken) -> Result<OtaHandle> {
        let attempts = self.config.transfer.connect_attempts;
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(OtaError::UserCanceled);
            }

            match self.bridge.begin(&job.url, self.config.http_timeout()).await {
                Ok(handle) => {
                    info!(url = %job.url, handle = handle.0, "Main-firmware update opened");
                    return Ok(handle);
                }
                Err(CallError::Partition(PartitionError::Connect(reason))) if attempt < attempts => {
                    warn!(attempt, attempts, reason = %reason, "Image server unreachable, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OtaError::UserCanceled),
                        _ = tokio::time::sleep(self.config.connect_backoff()) => {}
                    }
                }
                Err(e) => {
                    error!(url = %job.url, error = %e, "Could not open main-firmware update");
                    return Err(match e {
                        CallError::Partition(PartitionError::InvalidImage(_)) => {
                            OtaError::ImageHeaderReadFail
                        }
                        other => other.classify(OtaError::ConnectionFail),
                    });
                }
            }
        }
    }

    async fn install(
        &self,
        handle: OtaHandle,
        cancel: &CancellationToken,
        reporter: &StatusReporter,
    ) -> Result<()> {
        let image = self.bridge.image_descriptor(handle).await.map_err(|e| {
            error!(error = %e, "Could not read the image descriptor");
            e.classify(OtaError::ImageHeaderReadFail)
        })?;
        let running = self.bridge.running_descriptor().await.map_err(|e| {
            error!(error = %e, "Could not read the running partition descriptor");
            e.classify(OtaError::ImageHeaderReadFail)
        })?;

        if self.gate.compare(&image.version, &running.version) == VersionOrdering::OlderOrEqual {
            info!(
                offered = %image.version,
                installed = %running.version,
                "Main firmware already up to date"
            );
            return Err(OtaError::VersionTooOld);
        }

        info!(from = %running.version, to = %image.version, "Installing main firmware");

        let step = self.config.transfer.progress_step;
        let mut milestones: Option<Milestones> = None;

        loop {
            if cancel.is_cancelled() {
                info!("Main-firmware update canceled");
                return Err(OtaError::UserCanceled);
            }

            let status = self.bridge.perform(handle).await.map_err(|e| {
                error!(error = %e, "Main-firmware transfer failed");
                e.classify(OtaError::DownloadIncomplete)
            })?;

            match status {
                PerformStatus::InProgress { written, total } => {
                    let Some(total) = total else { continue };
                    let milestones = milestones.get_or_insert_with(|| Milestones::new(total, step));
                    if let Some(percent) = milestones.advance(written) {
                        debug!(percent, bytes = written, "Main-firmware progress");
                        reporter.progress(percent);
                    }
                }
                PerformStatus::Complete { written } => {
                    debug!(bytes = written, "Main-firmware image received");
                    break;
                }
            }
        }

        self.bridge.finish(handle).await.map_err(|e| {
            error!(error = %e, "Main-firmware image rejected at finish");
            e.classify(OtaError::FlasherWriteFail)
        })?;

        info!(version = %image.version, "Main firmware installed");
        Ok(())
    }
}

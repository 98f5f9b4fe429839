//! Artifact-specific job flows

use crate::download::DownloadDriver;
use crate::events::StatusReporter;
use crate::main_firmware::MainFirmwareFlow;
use async_trait::async_trait;
use tandem_core::{ArtifactKind, OtaJob, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Executes one job once the sequencer has picked it up
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion.
    ///
    /// Progress goes through `reporter`; the terminal record is published by
    /// the caller from the returned result.
    async fn run(&self, job: &OtaJob, cancel: CancellationToken, reporter: StatusReporter)
        -> Result<()>;
}

/// Routes companion artifacts through the download pipeline and main
/// firmware through the partition bridge
pub struct ArtifactRunner {
    download: DownloadDriver,
    main: MainFirmwareFlow,
}

impl ArtifactRunner {
    pub fn new(download: DownloadDriver, main: MainFirmwareFlow) -> Self {
        Self { download, main }
    }
}

#[async_trait]
impl JobRunner for ArtifactRunner {
    async fn run(
        &self,
        job: &OtaJob,
        cancel: CancellationToken,
        reporter: StatusReporter,
    ) -> Result<()> {
        reporter.progress(0);

        match job.kind {
            ArtifactKind::MainFirmware => self.main.run(job, &cancel, &reporter).await,
            ArtifactKind::CompanionFirmware | ArtifactKind::AiModel => {
                let written = self.download.run(job, &cancel, &reporter).await?;
                debug!(kind = ?job.kind, bytes = written, "Companion artifact flashed");
                Ok(())
            }
        }
    }
}

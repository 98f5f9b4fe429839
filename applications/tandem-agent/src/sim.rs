//! Simulated devices
//!
//! File-backed stand-ins for the hardware the engine drives:
//! - [`SimCompanion`] writes flashed chunks into a flash image file at the
//!   artifact's offset
//! - [`SimPartition`] streams a main-firmware image over HTTP into an
//!   OTA-slot file and reads its application descriptor
//! - [`SimSystem`] logs the restart request

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tandem_ota::{
    AppDescriptor, CompanionDevice, CompanionLink, DeviceInfo, LinkError, LinkTransport,
    OtaHandle, PartitionError, PartitionOps, PartitionRef, PerformStatus, SystemControl,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// First byte of every ESP application image
const IMAGE_MAGIC: u8 = 0xE9;
/// Magic word opening the application descriptor
const APP_DESC_MAGIC: u32 = 0xABCD_5432;
const APP_DESC_MAGIC_OFFSET: usize = 32;
const VERSION_RANGE: std::ops::Range<usize> = 48..80;
const PROJECT_NAME_RANGE: std::ops::Range<usize> = 80..112;

// =============================================================================
// Companion
// =============================================================================

/// Companion module whose flash is a local file
#[derive(Debug, Clone)]
pub struct SimCompanion {
    version: String,
    flash_path: PathBuf,
    spi_available: bool,
}

impl SimCompanion {
    pub fn new(version: impl Into<String>, flash_path: impl Into<PathBuf>, spi_available: bool) -> Self {
        Self {
            version: version.into(),
            flash_path: flash_path.into(),
            spi_available,
        }
    }

    pub fn flash_path(&self) -> &Path {
        &self.flash_path
    }
}

#[async_trait]
impl CompanionDevice for SimCompanion {
    async fn device_info(&self) -> Result<DeviceInfo, LinkError> {
        Ok(DeviceInfo {
            firmware_version: self.version.clone(),
        })
    }

    async fn open_link(&self, transport: LinkTransport) -> Result<Box<dyn CompanionLink>, LinkError> {
        if transport == LinkTransport::Spi && !self.spi_available {
            return Err(LinkError::Unavailable("SPI is not wired on this device".to_string()));
        }

        if let Some(parent) = self.flash_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LinkError::Io(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.flash_path)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;

        debug!(transport = ?transport, path = ?self.flash_path, "Companion link opened");
        Ok(Box::new(SimLink {
            file,
            transport,
            written: 0,
            in_session: false,
        }))
    }
}

struct SimLink {
    file: File,
    transport: LinkTransport,
    written: u64,
    in_session: bool,
}

#[async_trait]
impl CompanionLink for SimLink {
    async fn start(&mut self, offset: u32) -> Result<(), LinkError> {
        self.file
            .seek(std::io::SeekFrom::Start(u64::from(offset)))
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        self.written = 0;
        self.in_session = true;
        info!(offset = %format!("{offset:#x}"), transport = ?self.transport, "Companion flash session started");
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        if !self.in_session {
            return Err(LinkError::Rejected("write outside a flash session".to_string()));
        }
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), LinkError> {
        if !self.in_session {
            return Err(LinkError::Rejected("finish without a flash session".to_string()));
        }
        self.file
            .sync_all()
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        self.in_session = false;
        info!(bytes = self.written, "Companion flash session committed");
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), LinkError> {
        self.in_session = false;
        warn!(bytes = self.written, "Companion flash session discarded");
        Ok(())
    }
}

// =============================================================================
// Main partition
// =============================================================================

/// Read the application descriptor out of the head of an image
pub fn parse_app_descriptor(head: &[u8]) -> Result<AppDescriptor, PartitionError> {
    if head.len() < PROJECT_NAME_RANGE.end {
        return Err(PartitionError::InvalidImage(format!(
            "image header truncated at {} bytes",
            head.len()
        )));
    }
    if head[0] != IMAGE_MAGIC {
        return Err(PartitionError::InvalidImage(format!(
            "bad image magic {:#04x}",
            head[0]
        )));
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&head[APP_DESC_MAGIC_OFFSET..APP_DESC_MAGIC_OFFSET + 4]);
    if u32::from_le_bytes(word) != APP_DESC_MAGIC {
        return Err(PartitionError::InvalidImage(
            "application descriptor magic mismatch".to_string(),
        ));
    }

    Ok(AppDescriptor {
        version: c_string(&head[VERSION_RANGE]),
        project_name: c_string(&head[PROJECT_NAME_RANGE]),
    })
}

fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

struct OpenUpdate {
    handle: OtaHandle,
    response: reqwest::Response,
    file: File,
    /// Bytes read ahead for the descriptor and not yet written
    pending: Vec<u8>,
    written: u64,
    total: Option<u64>,
}

/// Main-firmware partition backed by an OTA-slot file
pub struct SimPartition {
    http: reqwest::Client,
    running_version: String,
    slot_path: PathBuf,
    next_handle: AtomicU32,
    open: Option<OpenUpdate>,
}

impl SimPartition {
    pub fn new(running_version: impl Into<String>, slot_path: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            running_version: running_version.into(),
            slot_path: slot_path.into(),
            next_handle: AtomicU32::new(1),
            open: None,
        }
    }

    fn partial_path(&self) -> PathBuf {
        self.slot_path.with_extension("partial")
    }

    fn update(&mut self, handle: OtaHandle) -> Result<&mut OpenUpdate, PartitionError> {
        match self.open.as_mut() {
            Some(update) if update.handle == handle => Ok(update),
            _ => Err(PartitionError::InvalidHandle(handle.0)),
        }
    }
}

#[async_trait]
impl PartitionOps for SimPartition {
    async fn begin(&mut self, url: &str, timeout: Duration) -> Result<OtaHandle, PartitionError> {
        if let Some(stale) = self.open.take() {
            warn!(handle = stale.handle.0, "Dropping an update that was never closed");
        }

        let response = tokio::time::timeout(timeout, self.http.get(url).send())
            .await
            .map_err(|_| PartitionError::Connect(format!("no response within {timeout:?}")))?
            .map_err(|e| PartitionError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PartitionError::Connect(format!("HTTP {}", status.as_u16())));
        }

        let partial = self.partial_path();
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PartitionError::Io(e.to_string()))?;
        }
        let file = File::create(&partial)
            .await
            .map_err(|e| PartitionError::Io(e.to_string()))?;

        let handle = OtaHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let total = response.content_length();
        info!(url, handle = handle.0, total = ?total, "Main-firmware download opened");

        self.open = Some(OpenUpdate {
            handle,
            response,
            file,
            pending: Vec::new(),
            written: 0,
            total,
        });
        Ok(handle)
    }

    async fn image_descriptor(&mut self, handle: OtaHandle) -> Result<AppDescriptor, PartitionError> {
        let update = self.update(handle)?;

        while update.pending.len() < PROJECT_NAME_RANGE.end {
            match update.response.chunk().await {
                Ok(Some(bytes)) => update.pending.extend_from_slice(&bytes),
                Ok(None) => break,
                Err(e) => return Err(PartitionError::Io(e.to_string())),
            }
        }

        parse_app_descriptor(&update.pending)
    }

    async fn running_partition(&mut self) -> Result<PartitionRef, PartitionError> {
        Ok(PartitionRef {
            label: "ota_0".to_string(),
            address: 0x0001_0000,
        })
    }

    async fn partition_descriptor(
        &mut self,
        partition: &PartitionRef,
    ) -> Result<AppDescriptor, PartitionError> {
        debug!(label = %partition.label, "Reading running partition descriptor");
        Ok(AppDescriptor {
            version: self.running_version.clone(),
            project_name: "tandem-main".to_string(),
        })
    }

    async fn perform(&mut self, handle: OtaHandle) -> Result<PerformStatus, PartitionError> {
        let update = self.update(handle)?;

        let data = if update.pending.is_empty() {
            match update.response.chunk().await {
                Ok(Some(bytes)) => bytes.to_vec(),
                Ok(None) => {
                    return Ok(PerformStatus::Complete {
                        written: update.written,
                    })
                }
                Err(e) => return Err(PartitionError::Io(e.to_string())),
            }
        } else {
            std::mem::take(&mut update.pending)
        };

        update
            .file
            .write_all(&data)
            .await
            .map_err(|e| PartitionError::Io(e.to_string()))?;
        update.written += data.len() as u64;

        Ok(PerformStatus::InProgress {
            written: update.written,
            total: update.total,
        })
    }

    async fn finish(&mut self, handle: OtaHandle) -> Result<(), PartitionError> {
        self.update(handle)?;
        let Some(mut update) = self.open.take() else {
            return Err(PartitionError::InvalidHandle(handle.0));
        };

        if let Some(total) = update.total {
            if update.written != total {
                return Err(PartitionError::Io(format!(
                    "image truncated: {} of {total} bytes",
                    update.written
                )));
            }
        }
        update
            .file
            .sync_all()
            .await
            .map_err(|e| PartitionError::Io(e.to_string()))?;

        tokio::fs::rename(self.partial_path(), &self.slot_path)
            .await
            .map_err(|e| PartitionError::Io(e.to_string()))?;
        info!(bytes = update.written, slot = ?self.slot_path, "OTA slot written and selected for boot");
        Ok(())
    }

    async fn abort(&mut self, handle: OtaHandle) -> Result<(), PartitionError> {
        self.update(handle)?;
        self.open = None;

        if let Err(e) = tokio::fs::remove_file(self.partial_path()).await {
            debug!(error = %e, "No partial slot image to remove");
        }
        info!(handle = handle.0, "Main-firmware update aborted");
        Ok(())
    }
}

// =============================================================================
// System
// =============================================================================

/// Logs restart requests instead of resetting the host
#[derive(Debug, Default)]
pub struct SimSystem {
    restarts: AtomicU32,
}

impl SimSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart requests seen so far
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl SystemControl for SimSystem {
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        warn!("Device restart requested, simulator keeps running");
    }
}

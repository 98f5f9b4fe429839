/// Engine configuration
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_core::ArtifactKind;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_transfer")]
    pub transfer: TransferSettings,

    #[serde(default = "default_flash")]
    pub flash: FlashSettings,

    #[serde(default = "default_stages")]
    pub stages: StageSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferSettings {
    /// Bytes buffered between the download and the flash writer
    #[serde(default = "default_ring_buffer_capacity")]
    pub ring_buffer_capacity: usize,

    /// Chunk buffers checked out by the flash writer
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// Consecutive stalled pushes tolerated before the download gives up
    #[serde(default = "default_push_attempts")]
    pub push_attempts: u32,

    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// How long the writer waits for a chunk's worth of data
    #[serde(default = "default_writer_starvation_ms")]
    pub writer_starvation_ms: u64,

    /// Connection attempts before a transfer is declared failed
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    #[serde(default = "default_bridge_post_timeout_ms")]
    pub bridge_post_timeout_ms: u64,

    /// Requests queued towards the privileged partition context
    #[serde(default = "default_bridge_queue_depth")]
    pub bridge_queue_depth: usize,

    /// Upper bound on waiting for both sides to acknowledge a cancel
    #[serde(default = "default_cancel_teardown_ms")]
    pub cancel_teardown_ms: u64,

    #[serde(default = "default_progress_step")]
    pub progress_step: u8,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlashSettings {
    #[serde(default = "default_companion_firmware_offset")]
    pub companion_firmware_offset: u32,

    #[serde(default = "default_ai_model_offset")]
    pub ai_model_offset: u32,

    #[serde(default = "default_spi_chunk_size")]
    pub spi_chunk_size: usize,

    #[serde(default = "default_uart_chunk_size")]
    pub uart_chunk_size: usize,

    /// Oldest companion firmware that speaks the SPI flashing path
    #[serde(default = "default_spi_min_version")]
    pub spi_min_version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSettings {
    #[serde(default = "default_main_budget_secs")]
    pub main_budget_secs: u64,

    #[serde(default = "default_companion_budget_secs")]
    pub companion_budget_secs: u64,

    #[serde(default = "default_reboot_delay_ms")]
    pub reboot_delay_ms: u64,

    /// Re-check period while the job worker waits for connectivity
    #[serde(default = "default_network_recheck_secs")]
    pub network_recheck_secs: u64,
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let transfer = &self.transfer;
        let flash = &self.flash;

        if transfer.ring_buffer_capacity == 0 {
            return Err(ConfigError("ring buffer capacity must be non-zero".to_string()));
        }

        if flash.spi_chunk_size == 0 || flash.uart_chunk_size == 0 {
            return Err(ConfigError("flasher chunk sizes must be non-zero".to_string()));
        }

        if transfer.ring_buffer_capacity < self.max_chunk_size() {
            return Err(ConfigError(format!(
                "ring buffer ({} bytes) cannot hold one flasher chunk ({} bytes)",
                transfer.ring_buffer_capacity,
                self.max_chunk_size()
            )));
        }

        if transfer.buffer_pool_size == 0 {
            return Err(ConfigError("buffer pool needs at least one buffer".to_string()));
        }

        if transfer.push_attempts == 0 || transfer.connect_attempts == 0 {
            return Err(ConfigError("attempt counts must be non-zero".to_string()));
        }

        if transfer.progress_step == 0 || transfer.progress_step > 100 {
            return Err(ConfigError(format!(
                "progress step {} is outside 1..=100",
                transfer.progress_step
            )));
        }

        if transfer.event_capacity == 0 || transfer.bridge_queue_depth == 0 {
            return Err(ConfigError("channel capacities must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Largest chunk the flash writer can be asked to send
    pub fn max_chunk_size(&self) -> usize {
        self.flash.spi_chunk_size.max(self.flash.uart_chunk_size)
    }

    /// Flash offset the companion `start` handshake uses for an artifact
    pub fn flash_offset(&self, kind: ArtifactKind) -> u32 {
        match kind {
            ArtifactKind::AiModel => self.flash.ai_model_offset,
            ArtifactKind::CompanionFirmware | ArtifactKind::MainFirmware => {
                self.flash.companion_firmware_offset
            }
        }
    }

    /// Watchdog budget of a stage in a manifest-driven update
    pub fn stage_budget(&self, kind: ArtifactKind) -> Duration {
        match kind {
            ArtifactKind::MainFirmware => Duration::from_secs(self.stages.main_budget_secs),
            ArtifactKind::CompanionFirmware | ArtifactKind::AiModel => {
                Duration::from_secs(self.stages.companion_budget_secs)
            }
        }
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.push_timeout_ms)
    }

    pub fn writer_starvation(&self) -> Duration {
        Duration::from_millis(self.transfer.writer_starvation_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.transfer.connect_backoff_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.http_timeout_ms)
    }

    pub fn bridge_post_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.bridge_post_timeout_ms)
    }

    pub fn cancel_teardown(&self) -> Duration {
        Duration::from_millis(self.transfer.cancel_teardown_ms)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.stages.reboot_delay_ms)
    }

    pub fn network_recheck(&self) -> Duration {
        Duration::from_secs(self.stages.network_recheck_secs)
    }
}

// Default values
fn default_transfer() -> TransferSettings {
    TransferSettings {
        ring_buffer_capacity: default_ring_buffer_capacity(),
        buffer_pool_size: default_buffer_pool_size(),
        push_attempts: default_push_attempts(),
        push_timeout_ms: default_push_timeout_ms(),
        writer_starvation_ms: default_writer_starvation_ms(),
        connect_attempts: default_connect_attempts(),
        connect_backoff_ms: default_connect_backoff_ms(),
        http_timeout_ms: default_http_timeout_ms(),
        bridge_post_timeout_ms: default_bridge_post_timeout_ms(),
        bridge_queue_depth: default_bridge_queue_depth(),
        cancel_teardown_ms: default_cancel_teardown_ms(),
        progress_step: default_progress_step(),
        event_capacity: default_event_capacity(),
    }
}

fn default_ring_buffer_capacity() -> usize {
    16 * 1024
}

fn default_buffer_pool_size() -> usize {
    2
}

fn default_push_attempts() -> u32 {
    60
}

fn default_push_timeout_ms() -> u64 {
    1000
}

fn default_writer_starvation_ms() -> u64 {
    60_000
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    1000
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_bridge_post_timeout_ms() -> u64 {
    10_000
}

fn default_bridge_queue_depth() -> usize {
    4
}

fn default_cancel_teardown_ms() -> u64 {
    60_000
}

fn default_progress_step() -> u8 {
    10
}

fn default_event_capacity() -> usize {
    128
}

fn default_flash() -> FlashSettings {
    FlashSettings {
        companion_firmware_offset: default_companion_firmware_offset(),
        ai_model_offset: default_ai_model_offset(),
        spi_chunk_size: default_spi_chunk_size(),
        uart_chunk_size: default_uart_chunk_size(),
        spi_min_version: default_spi_min_version(),
    }
}

fn default_companion_firmware_offset() -> u32 {
    0
}

fn default_ai_model_offset() -> u32 {
    0x0040_0000
}

fn default_spi_chunk_size() -> usize {
    256
}

fn default_uart_chunk_size() -> usize {
    128
}

fn default_spi_min_version() -> String {
    "1.1.0".to_string()
}

fn default_stages() -> StageSettings {
    StageSettings {
        main_budget_secs: default_main_budget_secs(),
        companion_budget_secs: default_companion_budget_secs(),
        reboot_delay_ms: default_reboot_delay_ms(),
        network_recheck_secs: default_network_recheck_secs(),
    }
}

fn default_main_budget_secs() -> u64 {
    10 * 60
}

fn default_companion_budget_secs() -> u64 {
    5 * 60
}

fn default_reboot_delay_ms() -> u64 {
    3000
}

fn default_network_recheck_secs() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer: default_transfer(),
            flash: default_flash(),
            stages: default_stages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_chunk_size(), 256);
        assert_eq!(config.stage_budget(ArtifactKind::MainFirmware), Duration::from_secs(600));
        assert_eq!(
            config.stage_budget(ArtifactKind::CompanionFirmware),
            Duration::from_secs(300)
        );
        assert_eq!(config.cancel_teardown(), Duration::from_secs(60));
    }

    #[test]
    fn offsets_differ_by_artifact() {
        let config = EngineConfig::default();
        assert_ne!(
            config.flash_offset(ArtifactKind::AiModel),
            config.flash_offset(ArtifactKind::CompanionFirmware)
        );
    }

    #[test]
    fn ring_smaller_than_chunk_is_rejected() {
        let mut config = EngineConfig::default();
        config.transfer.ring_buffer_capacity = 200;
        let err = config.validate().unwrap_err();
        assert!(err.0.contains("cannot hold"));
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = EngineConfig::default();
        config.transfer.push_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_style_input_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"flash": {"spi_chunk_size": 512}, "stages": {}}"#).unwrap();
        assert_eq!(config.flash.spi_chunk_size, 512);
        assert_eq!(config.flash.uart_chunk_size, 128);
        assert_eq!(config.transfer.push_attempts, 60);
        assert_eq!(config.stages.reboot_delay_ms, 3000);
    }
}

/// Updatable artifacts and the job record that carries them through the queue
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One updatable payload of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Firmware of the main compute module
    MainFirmware,
    /// Firmware of the companion vision module
    CompanionFirmware,
    /// AI inference model blob flashed onto the companion module
    AiModel,
}

impl ArtifactKind {
    /// Whether the artifact is written through the companion flashing link
    pub fn targets_companion(self) -> bool {
        matches!(self, ArtifactKind::CompanionFirmware | ArtifactKind::AiModel)
    }

    /// Whether the artifact is firmware (main or companion)
    pub fn is_firmware(self) -> bool {
        !matches!(self, ArtifactKind::AiModel)
    }

    /// Short name used in logs and CLI arguments
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::MainFirmware => "main-firmware",
            ArtifactKind::CompanionFirmware => "companion-firmware",
            ArtifactKind::AiModel => "ai-model",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "main-firmware" | "main" => Ok(ArtifactKind::MainFirmware),
            "companion-firmware" | "companion" => Ok(ArtifactKind::CompanionFirmware),
            "ai-model" | "model" => Ok(ArtifactKind::AiModel),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// Job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new random job ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to fetch one artifact and write it to its flash target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaJob {
    /// Unique identifier used in lifecycle events
    pub id: JobId,
    /// Which artifact this job updates
    pub kind: ArtifactKind,
    /// Where the image is fetched from
    pub url: String,
    /// Size announced by the caller, used when the server sends no length
    pub expected_size: Option<u64>,
}

impl OtaJob {
    /// Create a job with a fresh ID
    pub fn new(kind: ArtifactKind, url: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            kind,
            url: url.into(),
            expected_size: None,
        }
    }

    /// Attach the expected image size
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_cli_names() {
        for kind in [
            ArtifactKind::MainFirmware,
            ArtifactKind::CompanionFirmware,
            ArtifactKind::AiModel,
        ] {
            assert_eq!(kind.as_str().parse::<ArtifactKind>(), Ok(kind));
        }
        assert_eq!("model".parse::<ArtifactKind>(), Ok(ArtifactKind::AiModel));
        assert!("bootloader".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn companion_targets() {
        assert!(ArtifactKind::AiModel.targets_companion());
        assert!(ArtifactKind::CompanionFirmware.targets_companion());
        assert!(!ArtifactKind::MainFirmware.targets_companion());
        assert!(!ArtifactKind::AiModel.is_firmware());
    }

    #[test]
    fn jobs_get_distinct_ids() {
        let a = OtaJob::new(ArtifactKind::AiModel, "http://host/model.tflite");
        let b = OtaJob::new(ArtifactKind::AiModel, "http://host/model.tflite");
        assert_ne!(a.id, b.id);
        assert_eq!(a.expected_size, None);
        assert_eq!(a.with_expected_size(42).expected_size, Some(42));
    }
}

//! Remote update manifest
//!
//! ```json
//! {
//!   "companion": { "url": "https://cdn.example.com/vision-2.1.0.img", "version": "2.1.0" },
//!   "main": { "url": "https://cdn.example.com/main-1.4.2.bin", "version": "1.4.2", "size": 1843200 }
//! }
//! ```

use crate::{ArtifactKind, OtaError, Result};
use serde::{Deserialize, Serialize};

/// One artifact named by a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Download location
    #[serde(default)]
    pub url: String,
    /// Version of the offered image
    #[serde(default)]
    pub version: String,
    /// Image size, when the publisher knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ManifestEntry {
    /// Create an entry without a size hint
    pub fn new(url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: version.into(),
            size: None,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.version.trim().is_empty() {
            return Err("version is empty".to_string());
        }

        let parsed = url::Url::parse(&self.url).map_err(|e| format!("url '{}': {}", self.url, e))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(format!("unsupported scheme '{}'", other)),
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(format!("url '{}' has no host", self.url));
        }

        Ok(())
    }
}

/// Remote description of the artifacts that should be installed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Companion-module firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion: Option<ManifestEntry>,
    /// Main-module firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<ManifestEntry>,
}

impl UpdateManifest {
    /// Parse and validate a JSON manifest
    pub fn from_json(payload: &str) -> Result<Self> {
        let manifest: UpdateManifest =
            serde_json::from_str(payload).map_err(|_| OtaError::ManifestInvalid)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check that at least one artifact is named and every named one is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.companion.is_none() && self.main.is_none() {
            return Err(OtaError::ManifestInvalid);
        }

        for entry in self.companion.iter().chain(self.main.iter()) {
            if entry.validate().is_err() {
                return Err(OtaError::ManifestInvalid);
            }
        }

        Ok(())
    }

    /// Named entries in install order: companion first, then main
    pub fn entries(&self) -> impl Iterator<Item = (ArtifactKind, &ManifestEntry)> {
        self.companion
            .iter()
            .map(|e| (ArtifactKind::CompanionFirmware, e))
            .chain(self.main.iter().map(|e| (ArtifactKind::MainFirmware, e)))
    }

    /// Describe why validation fails, for logging
    pub fn validation_detail(&self) -> Option<String> {
        if self.companion.is_none() && self.main.is_none() {
            return Some("manifest names no artifact".to_string());
        }
        self.entries()
            .find_map(|(kind, entry)| entry.validate().err().map(|e| format!("{kind}: {e}")))
    }
}

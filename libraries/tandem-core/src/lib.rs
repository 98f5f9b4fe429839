//! Tandem Core
//!
//! Platform-agnostic domain types for the Tandem update orchestrator.
//!
//! A Tandem device is a main compute module paired with a companion vision
//! module over a serial link. Three artifacts can be updated independently:
//! main-module firmware, companion-module firmware and the AI inference model
//! that runs on the companion.
//!
//! This crate defines:
//! - **Jobs**: [`ArtifactKind`] and [`OtaJob`]
//! - **Version gate**: [`VersionTriple`], [`VersionGate`]
//! - **Status**: [`StatusRecord`], [`UpdateReport`]
//! - **Manifests**: [`UpdateManifest`] validation
//! - **Error Handling**: the [`OtaError`] taxonomy and [`Result`]
//!
//! # Example
//!
//! ```rust
//! use tandem_core::{VersionGate, VersionOrdering};
//!
//! let gate = VersionGate::new();
//! assert_eq!(gate.compare("2.0.0", "1.9.9"), VersionOrdering::Newer);
//! assert_eq!(gate.compare("1.0", "1.0.0"), VersionOrdering::OlderOrEqual);
//!
//! gate.set_override(true);
//! assert_eq!(gate.compare("0.0.1", "9.9.9"), VersionOrdering::Newer);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod artifact;
pub mod error;
pub mod manifest;
pub mod status;
pub mod version;

pub use artifact::{ArtifactKind, JobId, OtaJob};
pub use error::{OtaError, Result};
pub use manifest::{ManifestEntry, UpdateManifest};
pub use status::{ReportKind, StatusKind, StatusRecord, UpdateReport};
pub use version::{ForcedScope, VersionGate, VersionOrdering, VersionTriple};

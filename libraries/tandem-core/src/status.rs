//! Status records exchanged between the update stages and their observers

use crate::{ArtifactKind, OtaError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-artifact status class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Transfer in progress at the given percentage
    Upgrading,
    /// Artifact written and finalized
    Succeed,
    /// Terminal failure, see the error
    Fail,
    /// The version gate found nothing to install
    UpToDate,
}

/// Progress or outcome of one artifact stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// The artifact this record belongs to
    pub stage: ArtifactKind,
    /// Stage-local progress, 0-100
    pub percentage: u8,
    /// Status class
    pub kind: StatusKind,
    /// Failure reason when `kind` is `Fail`
    pub error: Option<OtaError>,
}

impl StatusRecord {
    /// In-progress record
    pub fn upgrading(stage: ArtifactKind, percentage: u8) -> Self {
        Self {
            stage,
            percentage: percentage.min(100),
            kind: StatusKind::Upgrading,
            error: None,
        }
    }

    /// Successful completion
    pub fn succeed(stage: ArtifactKind) -> Self {
        Self {
            stage,
            percentage: 100,
            kind: StatusKind::Succeed,
            error: None,
        }
    }

    /// Failure at the given progress point
    pub fn fail(stage: ArtifactKind, error: OtaError, percentage: u8) -> Self {
        Self {
            stage,
            percentage: percentage.min(100),
            kind: StatusKind::Fail,
            error: Some(error),
        }
    }

    /// Nothing to install
    pub fn up_to_date(stage: ArtifactKind) -> Self {
        Self {
            stage,
            percentage: 100,
            kind: StatusKind::UpToDate,
            error: None,
        }
    }

    /// Whether this record ends its stage
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, StatusKind::Upgrading)
    }
}

/// Combined status class of a manifest-driven update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Every named artifact is already current
    UpToDate,
    /// In progress at the given combined percentage
    Upgrading,
    /// All selected stages succeeded
    Succeeded,
    /// A stage failed, see the error
    Failed,
}

/// Combined progress of a manifest-driven update on a single 0-100 scale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Status class
    pub kind: ReportKind,
    /// Combined progress, 0-100
    pub percentage: u8,
    /// Failure reason when `kind` is `Failed`
    pub error: Option<OtaError>,
    /// When the report was produced
    pub reported_at: DateTime<Utc>,
}

impl UpdateReport {
    /// Build a report stamped with the current time
    pub fn new(kind: ReportKind, percentage: u8, error: Option<OtaError>) -> Self {
        Self {
            kind,
            percentage: percentage.min(100),
            error,
            reported_at: Utc::now(),
        }
    }

    /// Whether this report ends the sequence
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ReportKind::Upgrading)
    }
}

//! Migration record: persisted state of one content-transfer job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TransitionError;
use super::ids::{MigrationId, VersionId};
use super::urn::ContentUrn;

/// Migration status.
///
/// State transitions:
/// - Queued -> InProgress -> Success
/// - Queued -> InProgress -> Error
///
/// Success and Error are terminal; nothing moves a record backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Queued,
    InProgress,
    Success,
    Error,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStatus::Success | MigrationStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Queued => "QUEUED",
            MigrationStatus::InProgress => "IN_PROGRESS",
            MigrationStatus::Success => "SUCCESS",
            MigrationStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(MigrationStatus::Queued),
            "IN_PROGRESS" => Ok(MigrationStatus::InProgress),
            "SUCCESS" => Ok(MigrationStatus::Success),
            "ERROR" => Ok(MigrationStatus::Error),
            other => Err(format!("unknown migration status {other:?}")),
        }
    }
}

pub const MESSAGE_QUEUED: &str = "Queued for migration";
pub const MESSAGE_SELECTED: &str = "Selected for migration";
pub const MESSAGE_UNKNOWN_ERROR: &str = "Unknown error occurred";
pub const MESSAGE_INTERRUPTED: &str = "Migration was interrupted by an internal server error";

/// Persisted state of one migration.
///
/// Design:
/// - Created by the caller (status Queued), mutated only by the engine.
/// - All state transitions happen through the methods below.
/// - `destination_urn` is Some exactly when status is Success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub version: VersionId,
    pub source_urn: ContentUrn,
    pub destination_backend: String,
    pub destination_urn: Option<ContentUrn>,
    pub status: MigrationStatus,
    pub message: String,

    /// bytes written / total bytes, in [0, 1].
    pub progress: f64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    pub fn new(
        id: MigrationId,
        version: VersionId,
        source_urn: ContentUrn,
        destination_backend: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            version,
            source_urn,
            destination_backend: destination_backend.into(),
            destination_urn: None,
            status: MigrationStatus::Queued,
            message: MESSAGE_QUEUED.to_string(),
            progress: 0.0,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: MigrationStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.status, to),
            (MigrationStatus::Queued, MigrationStatus::InProgress)
                | (MigrationStatus::InProgress, MigrationStatus::Success)
                | (MigrationStatus::InProgress, MigrationStatus::Error)
        );
        if !allowed {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Accepted by the worker.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(MigrationStatus::InProgress)?;
        self.message = MESSAGE_SELECTED.to_string();
        self.started_at = Some(now);
        Ok(())
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    /// Progress never decreases and stays within [0, 1].
    pub fn record_progress(&mut self, ratio: f64) {
        if self.status != MigrationStatus::InProgress || ratio.is_nan() {
            return;
        }
        self.progress = self.progress.max(ratio.clamp(0.0, 1.0));
    }

    pub fn succeed(
        &mut self,
        destination_urn: ContentUrn,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(MigrationStatus::Success)?;
        self.message = format!("Uploaded to {destination_urn}");
        self.destination_urn = Some(destination_urn);
        self.progress = 1.0;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(MigrationStatus::Error)?;
        self.message = message.into();
        self.finished_at = Some(now);
        Ok(())
    }
}

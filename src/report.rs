//! Per-patient outcomes and the run summary built from them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum PatientOutcome {
    Written,
    /// An existing entry was overwritten
    Replaced,
    /// An entry already existed and overwrite was off
    SkippedExisting,
    /// No series was included
    SkippedEmpty,
    Failed(String),
}

impl fmt::Display for PatientOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientOutcome::Written => write!(f, "written"),
            PatientOutcome::Replaced => write!(f, "replaced"),
            PatientOutcome::SkippedExisting => write!(f, "skipped, already archived"),
            PatientOutcome::SkippedEmpty => write!(f, "skipped, no included series"),
            PatientOutcome::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientReport {
    pub patient_id: String,
    pub outcome: PatientOutcome,
    pub images: usize,
    pub masks: usize,
    pub warnings: Vec<String>,
}

impl PatientReport {
    pub fn new(patient_id: impl Into<String>, outcome: PatientOutcome) -> Self {
        Self {
            patient_id: patient_id.into(),
            outcome,
            images: 0,
            masks: 0,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub written: usize,
    pub replaced: usize,
    pub skipped_existing: usize,
    pub skipped_empty: usize,
    /// `(patient, message)` for every failed patient
    pub failed: Vec<(String, String)>,
    pub warnings: usize,
}

impl RunSummary {
    pub fn from_reports(reports: &[PatientReport], started_at: DateTime<Utc>) -> Self {
        let count = |wanted: PatientOutcome| reports.iter().filter(|r| r.outcome == wanted).count();
        Self {
            started_at,
            finished_at: Utc::now(),
            processed: reports.len(),
            written: count(PatientOutcome::Written),
            replaced: count(PatientOutcome::Replaced),
            skipped_existing: count(PatientOutcome::SkippedExisting),
            skipped_empty: count(PatientOutcome::SkippedEmpty),
            failed: reports
                .iter()
                .filter_map(|r| match &r.outcome {
                    PatientOutcome::Failed(message) => Some((r.patient_id.clone(), message.clone())),
                    _ => None,
                })
                .collect(),
            warnings: reports.iter().map(|r| r.warnings.len()).sum(),
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_existing + self.skipped_empty
    }
}

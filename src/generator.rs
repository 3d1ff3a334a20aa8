//! Lazy, patient-at-a-time traversal of a cohort root.

use std::path::{Path, PathBuf};

use tracing::{error, info};
use walkdir::WalkDir;

use crate::association::{AssociationEngine, KeepMatchedOnly, PatientRecord, SeriesDecider};
use crate::criteria::SelectionCriteria;
use crate::dicom_reader::ImageReader;
use crate::error::{DatasetError, Result};
use crate::report::{PatientOutcome, PatientReport};

/// Position of a generator within its cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Patients consumed so far, yielded or not
    pub current: usize,
    pub total: usize,
}

/// Yields one [`PatientRecord`] per patient directory that has at least one
/// included series, in lexicographic order of the directory names.
///
/// Patients that fail or turn out empty are not yielded; they are recorded
/// in [`PatientDataGenerator::reports`] instead. A generator runs once; build
/// a new one over the same root to start again.
pub struct PatientDataGenerator<'a, D: SeriesDecider + ?Sized = KeepMatchedOnly> {
    engine: AssociationEngine<'a>,
    criteria: Option<&'a mut SelectionCriteria>,
    decider: &'a mut D,
    patients: Vec<PathBuf>,
    next_index: usize,
    reports: Vec<PatientReport>,
}

impl<'a, D: SeriesDecider + ?Sized> PatientDataGenerator<'a, D> {
    pub fn new(
        root: &Path,
        engine: AssociationEngine<'a>,
        criteria: Option<&'a mut SelectionCriteria>,
        decider: &'a mut D,
    ) -> Result<Self> {
        let patients = list_patients(root)?;
        info!("Found {} patient directories in {:?}", patients.len(), root);
        Ok(Self {
            engine,
            criteria,
            decider,
            patients,
            next_index: 0,
            reports: Vec::new(),
        })
    }

    pub fn patients(&self) -> &[PathBuf] {
        &self.patients
    }

    pub fn progress(&self) -> Progress {
        Progress {
            current: self.next_index,
            total: self.patients.len(),
        }
    }

    /// Reports of patients that were skipped or failed so far.
    pub fn reports(&self) -> &[PatientReport] {
        &self.reports
    }

    pub fn take_reports(&mut self) -> Vec<PatientReport> {
        std::mem::take(&mut self.reports)
    }

    pub fn criteria(&self) -> Option<&SelectionCriteria> {
        self.criteria.as_deref()
    }

    pub fn image_reader(&self) -> &'a dyn ImageReader {
        self.engine.image_reader()
    }
}

impl<D: SeriesDecider + ?Sized> Iterator for PatientDataGenerator<'_, D> {
    type Item = PatientRecord;

    fn next(&mut self) -> Option<PatientRecord> {
        while let Some(dir) = self.patients.get(self.next_index) {
            self.next_index += 1;

            match self
                .engine
                .associate(dir, self.criteria.as_deref_mut(), &mut *self.decider)
            {
                Ok(record) if record.is_empty() => {
                    info!("Patient {}: no included series, skipping", record.patient_id);
                    let mut report = PatientReport::new(record.patient_id, PatientOutcome::SkippedEmpty);
                    report.warnings = record.warnings.iter().map(ToString::to_string).collect();
                    self.reports.push(report);
                }
                Ok(record) => return Some(record),
                Err(e) => {
                    let patient_id = crate::association::patient_id_of(dir);
                    error!("Patient {} failed: {}", patient_id, e);
                    self.reports
                        .push(PatientReport::new(patient_id, PatientOutcome::Failed(e.to_string())));
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.patients.len() - self.next_index))
    }
}

/// Non-hidden subdirectories of `root`, sorted by name.
fn list_patients(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(DatasetError::MissingRoot(root.to_path_buf()));
    }

    let mut patients = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|_| DatasetError::MissingRoot(root.to_path_buf()))?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.path().is_dir() {
            patients.push(entry.into_path());
        }
    }
    Ok(patients)
}

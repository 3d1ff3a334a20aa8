//! Run configuration shared by the library and the CLI.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGES_DIR: &str = "images";
pub const DEFAULT_SEGMENTATIONS_DIR: &str = "segmentations";

/// Names of the per-patient subdirectories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientLayout {
    pub images_dir: String,
    pub segmentations_dir: String,
}

impl Default for PatientLayout {
    fn default() -> Self {
        Self {
            images_dir: DEFAULT_IMAGES_DIR.to_string(),
            segmentations_dir: DEFAULT_SEGMENTATIONS_DIR.to_string(),
        }
    }
}

/// How files inside one patient directory are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Maximum recursion depth below the images/segmentations directories
    pub max_depth: usize,
    /// Read slice headers of one patient on the rayon pool
    pub parallel: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            parallel: false,
        }
    }
}

/// Arguments of one dataset assembly run.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub patients_root: PathBuf,
    pub dataset_path: PathBuf,
    pub layout: PatientLayout,
    pub scan: ScanOptions,
    /// Replace entries already present in the archive
    pub overwrite: bool,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl CreateOptions {
    pub fn new(patients_root: impl Into<PathBuf>, dataset_path: impl Into<PathBuf>) -> Self {
        Self {
            patients_root: patients_root.into(),
            dataset_path: dataset_path.into(),
            layout: PatientLayout::default(),
            scan: ScanOptions::default(),
            overwrite: false,
            show_progress: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

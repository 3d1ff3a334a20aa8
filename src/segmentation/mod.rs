//! Segmentation volumes and the readers that produce them.

pub mod dicom_seg;
pub mod nifti_mask;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::series::list_files;
use crate::volume::MaskVolume;

/// The UID a segmentation was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceUid {
    /// Explicit SeriesInstanceUID of the source image
    Series(String),
    /// FrameOfReferenceUID shared with the source image
    FrameOfReference(String),
    /// A UID of unknown kind, e.g. taken from a file name
    Unqualified(String),
}

impl ReferenceUid {
    pub fn uid(&self) -> &str {
        match self {
            ReferenceUid::Series(uid)
            | ReferenceUid::FrameOfReference(uid)
            | ReferenceUid::Unqualified(uid) => uid,
        }
    }
}

impl fmt::Display for ReferenceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceUid::Series(uid) => write!(f, "series {uid}"),
            ReferenceUid::FrameOfReference(uid) => write!(f, "frame of reference {uid}"),
            ReferenceUid::Unqualified(uid) => write!(f, "uid {uid}"),
        }
    }
}

/// One segmented structure read from a segmentation file.
#[derive(Debug)]
pub struct SegmentationRecord {
    pub source: PathBuf,
    pub reference: Option<ReferenceUid>,
    /// Label embedded in the file or derived from its name
    pub label: Option<String>,
    pub mask: Box<dyn MaskVolume>,
}

impl SegmentationRecord {
    /// File name without segmentation extensions.
    pub fn stem(&self) -> String {
        let name = self
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        strip_extension(&name).to_string()
    }
}

fn strip_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for ext in [".nii.gz", ".nii", ".hdr.gz", ".hdr", ".dcm"] {
        if lower.ends_with(ext) {
            return &name[..name.len() - ext.len()];
        }
    }
    name
}

/// Parser for segmentation files.
pub trait SegmentationReader: Sync {
    /// All segmented structures stored in `path`.
    fn read(&self, path: &Path) -> Result<Vec<SegmentationRecord>>;
}

/// Reads NIfTI masks by extension and everything else as DICOM SEG. The
/// `.img` half of a two-file NIfTI pair is read through its `.hdr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSegmentationReader;

impl DefaultSegmentationReader {
    pub fn new() -> Self {
        Self
    }
}

impl SegmentationReader for DefaultSegmentationReader {
    fn read(&self, path: &Path) -> Result<Vec<SegmentationRecord>> {
        if nifti_mask::is_nifti(path) {
            Ok(vec![nifti_mask::read_record(path)?])
        } else if nifti_mask::is_image_companion(path) {
            Ok(Vec::new())
        } else {
            dicom_seg::read_records(path)
        }
    }
}

/// Reads every segmentation under `dir`. A missing directory means the
/// patient has no segmentations; unreadable files are skipped with a warning.
pub fn collect_segmentations(
    reader: &dyn SegmentationReader,
    dir: &Path,
    max_depth: usize,
) -> Vec<SegmentationRecord> {
    if !dir.is_dir() {
        debug!("No segmentation directory at {:?}", dir);
        return Vec::new();
    }

    let files = match list_files(dir, max_depth) {
        Ok(files) => files,
        Err(e) => {
            warn!("Cannot list segmentations in {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for file in files {
        match reader.read(&file) {
            Ok(found) => records.extend(found),
            Err(e) => warn!("Skipping segmentation {:?}: {}", file, e),
        }
    }
    records
}

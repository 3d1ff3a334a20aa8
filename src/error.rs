//! Error types for dataset assembly

use std::path::PathBuf;
use thiserror::Error;

use crate::volume::Shape;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Everything that can go wrong while cataloguing, linking or archiving.
///
/// Only [`DatasetError::MissingRoot`] and [`DatasetError::ArchiveUnwritable`]
/// abort a whole run; every other variant is contained at the patient
/// boundary or below it.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("NPY encoding error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("NPY decoding error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("array shape error: {0}")]
    ArrayShape(#[from] ndarray::ShapeError),

    #[error("failed to read DICOM file {path:?}: {message}")]
    Dicom { path: PathBuf, message: String },

    /// A series UID group whose files disagree on geometry or frame of reference
    #[error("malformed series {series_uid}: {reason}")]
    MalformedSeries { series_uid: String, reason: String },

    #[error("no readable image files in {0:?}")]
    NoReadableImages(PathBuf),

    #[error("cannot read patient directory {path:?}: {source}")]
    UnreadablePatient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported pixel data in {path:?}: {reason}")]
    UnsupportedPixelData { path: PathBuf, reason: String },

    #[error("invalid NIfTI file {path:?}: {reason}")]
    Nifti { path: PathBuf, reason: String },

    #[error("invalid segmentation file {path:?}: {reason}")]
    Segmentation { path: PathBuf, reason: String },

    #[error("mask {organ:?} has shape {found:?}, expected {expected:?}")]
    MaskShape {
        organ: String,
        expected: Shape,
        found: Shape,
    },

    #[error("patient root {0:?} does not exist or is not a directory")]
    MissingRoot(PathBuf),

    #[error("archive path {path:?} is not writable: {source}")]
    ArchiveUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid archive key {0:?}")]
    InvalidKey(String),

    #[error("archive has no entry {0:?}")]
    NotFound(String),
}

impl DatasetError {
    /// Whether this error must stop the whole run instead of one patient.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DatasetError::MissingRoot(_) | DatasetError::ArchiveUnwritable { .. }
        )
    }

    pub(crate) fn dicom(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        DatasetError::Dicom {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn unwritable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::ArchiveUnwritable {
            path: path.into(),
            source,
        }
    }
}

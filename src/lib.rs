//! Assemble per-patient DICOM series and their segmentations into a keyed,
//! randomly accessible dataset archive.
//!
//! A cohort root holds one directory per patient, each with an images and a
//! segmentations subdirectory. For every patient the series are catalogued,
//! selected by description and by segmentation presence, linked to their
//! masks and written as one archive entry.

pub mod association;
pub mod config;
pub mod criteria;
pub mod dataset;
pub mod dicom_reader;
pub mod error;
pub mod generator;
pub mod linker;
pub mod npy;
pub mod organs;
pub mod report;
pub mod segmentation;
pub mod series;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;

pub use association::{
    AssociationEngine, FnDecider, ImageAssociation, InclusionReason, KeepMatchedOnly, PatientRecord,
    PatientWarning, PromptDecider, SeriesDecider,
};
pub use config::{CreateOptions, PatientLayout, ScanOptions};
pub use criteria::SelectionCriteria;
pub use dataset::{PatientDataset, PatientManifest};
pub use dicom_reader::{DicomImageReader, ImageReader};
pub use error::{DatasetError, Result};
pub use generator::{PatientDataGenerator, Progress};
pub use linker::{LinkWarning, SegmentationLinker};
pub use organs::OrganDictionary;
pub use report::{PatientOutcome, PatientReport, RunSummary};
pub use segmentation::{DefaultSegmentationReader, ReferenceUid, SegmentationReader, SegmentationRecord};
pub use series::{RawSeries, SeriesCatalog};
pub use volume::{ImageVolume, MaskVolume};

//! The on-disk archive: one zip container per patient plus a dataset
//! manifest.
//!
//! ```text
//! <dataset>/
//!   dataset.json
//!   <patient>.zip
//!     patient.json
//!     <image>/attributes.json
//!     <image>/image.npy
//!     <image>/masks/<organ>.npy
//! ```
//!
//! A patient container is staged under a hidden `.partial` name and renamed
//! into place once complete, so every key in the directory is either absent
//! or fully written.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::association::{AssociationEngine, ImageAssociation, InclusionReason, KeepMatchedOnly, PatientRecord, SeriesDecider};
use crate::config::{CreateOptions, PatientLayout};
use crate::criteria::{SelectionCriteria, UNFILTERED_ROLE};
use crate::dicom_reader::{DicomImageReader, ImageReader, PatientInfo};
use crate::error::{DatasetError, Result};
use crate::generator::PatientDataGenerator;
use crate::npy;
use crate::organs::OrganDictionary;
use crate::report::{PatientOutcome, PatientReport, RunSummary};
use crate::segmentation::{DefaultSegmentationReader, SegmentationReader};
use crate::volume::{ImageVolume, MaskVolume, Shape};

pub const DATASET_MANIFEST: &str = "dataset.json";
const PATIENT_MANIFEST: &str = "patient.json";
const ENTRY_EXTENSION: &str = "zip";
const PARTIAL_SUFFIX: &str = ".partial";
const KEY_DIGEST_LEN: usize = 16;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatasetManifest {
    pub processing_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: String,
    pub layout: PatientLayout,
    /// Selection criteria as they stood at the end of the last run
    pub criteria: Option<SelectionCriteria>,
    pub last_run: Option<RunSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PatientManifest {
    pub patient_id: String,
    pub patient: PatientInfo,
    pub written_at: DateTime<Utc>,
    pub images: Vec<ImageManifest>,
    pub warnings: Vec<String>,
}

impl PatientManifest {
    pub fn image(&self, key: &str) -> Option<&ImageManifest> {
        self.images.iter().find(|i| i.key == key)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageManifest {
    pub key: String,
    pub series_uid: String,
    pub description: Option<String>,
    pub modality: Option<String>,
    pub role: Option<String>,
    pub inclusion: InclusionReason,
    pub shape: Shape,
    pub masks: Vec<MaskManifest>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaskManifest {
    pub key: String,
    pub organ: String,
    pub source: PathBuf,
    /// Number of voxels inside the mask
    pub voxels: usize,
}

/// Handle on a dataset directory.
#[derive(Debug, Clone)]
pub struct PatientDataset {
    path: PathBuf,
    overwrite: bool,
}

impl PatientDataset {
    /// Opens or creates the dataset directory and clears staging files left
    /// by an interrupted run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path).map_err(|e| DatasetError::unwritable(&path, e))?;

        for entry in fs::read_dir(&path).map_err(|e| DatasetError::unwritable(&path, e))? {
            let entry = entry.map_err(|e| DatasetError::unwritable(&path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                warn!("Removing stale staging file {:?}", entry.path());
                fs::remove_file(entry.path()).map_err(|e| DatasetError::unwritable(entry.path(), e))?;
            }
        }

        Ok(Self {
            path,
            overwrite: false,
        })
    }

    /// Opens an existing dataset for reading without touching its files.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(DatasetError::NotFound(path.display().to_string()));
        }
        Ok(Self {
            path,
            overwrite: false,
        })
    }

    /// Replace existing patient entries instead of skipping them.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds a dataset from a patient root with the DICOM and segmentation
    /// readers, keeping only series matched by `criteria` or segmented.
    pub fn create(
        options: &CreateOptions,
        criteria: Option<&mut SelectionCriteria>,
        organs: &OrganDictionary,
    ) -> Result<RunSummary> {
        let image_reader = DicomImageReader::new();
        let segmentation_reader = DefaultSegmentationReader::new();
        Self::create_with(
            options,
            &image_reader,
            &segmentation_reader,
            organs,
            criteria,
            &mut KeepMatchedOnly,
        )
    }

    /// [`PatientDataset::create`] with explicit readers and decider.
    pub fn create_with<D>(
        options: &CreateOptions,
        image_reader: &dyn ImageReader,
        segmentation_reader: &dyn SegmentationReader,
        organs: &OrganDictionary,
        criteria: Option<&mut SelectionCriteria>,
        decider: &mut D,
    ) -> Result<RunSummary>
    where
        D: SeriesDecider + ?Sized,
    {
        let started_at = Utc::now();
        let engine = AssociationEngine::new(image_reader, segmentation_reader, organs)
            .with_layout(options.layout.clone())
            .with_scan(options.scan);
        let mut generator = PatientDataGenerator::new(&options.patients_root, engine, criteria, decider)?;
        let dataset = PatientDataset::open(&options.dataset_path)?.overwrite(options.overwrite);

        let progress = options
            .show_progress
            .then(|| progress_bar(generator.patients().len() as u64));
        let reports = dataset.write_from(&mut generator, progress.as_ref())?;
        if let Some(pb) = &progress {
            pb.finish_with_message("done");
        }

        let summary = RunSummary::from_reports(&reports, started_at);
        dataset.write_dataset_manifest(&options.layout, generator.criteria(), &summary)?;
        info!(
            "Dataset {:?}: {} processed, {} written, {} replaced, {} skipped, {} failed",
            dataset.path,
            summary.processed,
            summary.written,
            summary.replaced,
            summary.skipped(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Drains `generator`, writing every record. Patient failures are
    /// reported; only fatal errors stop the loop.
    pub fn write_from<D>(
        &self,
        generator: &mut PatientDataGenerator<'_, D>,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<PatientReport>>
    where
        D: SeriesDecider + ?Sized,
    {
        let reader = generator.image_reader();
        let mut reports = Vec::new();

        while let Some(record) = generator.next() {
            reports.extend(generator.take_reports());
            let report = match self.write_record(&record, reader) {
                Ok(report) => report,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Patient {} not written: {}", record.patient_id, e);
                    PatientReport::new(record.patient_id.as_str(), PatientOutcome::Failed(e.to_string()))
                }
            };
            reports.push(report);
            if let Some(pb) = progress {
                pb.set_position(generator.progress().current as u64);
            }
        }

        reports.extend(generator.take_reports());
        if let Some(pb) = progress {
            pb.set_position(generator.progress().current as u64);
        }
        Ok(reports)
    }

    /// Writes one patient entry atomically.
    pub fn write_record(&self, record: &PatientRecord, reader: &dyn ImageReader) -> Result<PatientReport> {
        let key = entry_key(&record.patient_id)?;
        let target = self.entry_file(&key);
        let mut warnings: Vec<String> = record.warnings.iter().map(ToString::to_string).collect();

        let existed = target.exists();
        if existed && !self.overwrite {
            warn!("Patient {} already in dataset, skipping", record.patient_id);
            let mut report = PatientReport::new(record.patient_id.as_str(), PatientOutcome::SkippedExisting);
            report.warnings = warnings;
            return Ok(report);
        }

        let staging = self
            .path
            .join(format!(".{key}.{}{PARTIAL_SUFFIX}", Uuid::new_v4()));
        let manifest = match self.write_entry(&staging, record, reader, &mut warnings) {
            Ok(manifest) => manifest,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&staging) {
                    debug!("Could not remove {:?}: {}", staging, cleanup);
                }
                return Err(e);
            }
        };
        fs::rename(&staging, &target).map_err(|e| DatasetError::unwritable(&target, e))?;

        let outcome = if existed {
            info!("Patient {} replaced", record.patient_id);
            PatientOutcome::Replaced
        } else {
            info!("Patient {} written", record.patient_id);
            PatientOutcome::Written
        };
        Ok(PatientReport {
            patient_id: record.patient_id.clone(),
            outcome,
            images: manifest.images.len(),
            masks: manifest.images.iter().map(|i| i.masks.len()).sum(),
            warnings,
        })
    }

    /// Creates the staging file and fills it. Only failures on the staging
    /// file itself are fatal; payload errors fail the patient.
    fn write_entry(
        &self,
        staging: &Path,
        record: &PatientRecord,
        reader: &dyn ImageReader,
        warnings: &mut Vec<String>,
    ) -> Result<PatientManifest> {
        let unwritable = |e: io::Error| DatasetError::unwritable(staging, e);

        let file = File::create(staging).map_err(unwritable)?;
        let mut zip = ZipWriter::new(file);
        let manifest = write_patient(&mut zip, record, reader, warnings)?;
        let file = zip.finish()?;
        file.sync_all().map_err(unwritable)?;
        Ok(manifest)
    }

    fn entry_file(&self, key: &str) -> PathBuf {
        self.path.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    /// Patient identifiers present in the dataset, sorted. The identifier
    /// comes from each entry's `patient.json`, or the file stem when that
    /// cannot be read.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if hidden || path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            match read_patient_id(&path) {
                Ok(patient_id) => keys.push(patient_id),
                Err(e) => {
                    debug!("No patient manifest in {:?}: {}", path, e);
                    if let Some(stem) = path.file_stem() {
                        keys.push(stem.to_string_lossy().into_owned());
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn contains(&self, patient_id: &str) -> bool {
        entry_key(patient_id)
            .map(|key| self.entry_file(&key).is_file())
            .unwrap_or(false)
    }

    fn archive(&self, patient_id: &str) -> Result<ZipArchive<BufReader<File>>> {
        let path = self.entry_file(&entry_key(patient_id)?);
        if !path.is_file() {
            return Err(DatasetError::NotFound(patient_id.to_string()));
        }
        Ok(ZipArchive::new(BufReader::new(File::open(path)?))?)
    }

    fn read_member<T>(
        &self,
        patient_id: &str,
        member: &str,
        read: impl FnOnce(&mut dyn Read) -> Result<T>,
    ) -> Result<T> {
        let mut archive = self.archive(patient_id)?;
        let mut file = archive.by_name(member).map_err(|e| match e {
            ZipError::FileNotFound => DatasetError::NotFound(format!("{patient_id}/{member}")),
            other => other.into(),
        })?;
        read(&mut file)
    }

    pub fn read_manifest(&self, patient_id: &str) -> Result<PatientManifest> {
        self.read_member(patient_id, PATIENT_MANIFEST, |r| Ok(serde_json::from_reader(r)?))
    }

    pub fn read_attributes(&self, patient_id: &str, image_key: &str) -> Result<serde_json::Value> {
        self.read_member(patient_id, &format!("{image_key}/attributes.json"), |r| {
            Ok(serde_json::from_reader(r)?)
        })
    }

    /// Pixel array of one image, `[slices, rows, columns]`.
    pub fn read_image(&self, patient_id: &str, image_key: &str) -> Result<(Shape, Vec<f32>)> {
        self.read_member(patient_id, &format!("{image_key}/image.npy"), |r| npy::read(r))
    }

    pub fn read_mask(&self, patient_id: &str, image_key: &str, mask_key: &str) -> Result<(Shape, Vec<u8>)> {
        self.read_member(patient_id, &format!("{image_key}/masks/{mask_key}.npy"), |r| {
            npy::read(r)
        })
    }

    pub fn read_dataset_manifest(&self) -> Result<Option<DatasetManifest>> {
        let path = self.path.join(DATASET_MANIFEST);
        if !path.is_file() {
            return Ok(None);
        }
        let file = BufReader::new(File::open(path)?);
        Ok(Some(serde_json::from_reader(file)?))
    }

    /// Rewrites `dataset.json`, keeping the creation time of an earlier run.
    pub fn write_dataset_manifest(
        &self,
        layout: &PatientLayout,
        criteria: Option<&SelectionCriteria>,
        summary: &RunSummary,
    ) -> Result<()> {
        let created_at = self
            .read_dataset_manifest()
            .ok()
            .flatten()
            .map(|m| m.created_at)
            .unwrap_or(summary.started_at);
        let manifest = DatasetManifest {
            processing_id: Uuid::new_v4().to_string(),
            created_at,
            updated_at: summary.finished_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
            layout: layout.clone(),
            criteria: criteria.cloned(),
            last_run: Some(summary.clone()),
        };

        let target = self.path.join(DATASET_MANIFEST);
        let staging = self
            .path
            .join(format!(".{DATASET_MANIFEST}.{}{PARTIAL_SUFFIX}", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(&manifest)?;
        File::create(&staging)
            .and_then(|mut f| f.write_all(&json).and_then(|_| f.sync_all()))
            .and_then(|_| fs::rename(&staging, &target))
            .map_err(|e| DatasetError::unwritable(&target, e))
    }
}

/// Writes the members of one patient container.
fn write_patient<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    record: &PatientRecord,
    reader: &dyn ImageReader,
    warnings: &mut Vec<String>,
) -> Result<PatientManifest> {
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut images = Vec::with_capacity(record.images.len());
    for (image, key) in record.images.iter().zip(image_keys(&record.images)) {
        let series = &image.series;
        let volume = series.volume(reader);
        let pixels = volume.read_array()?;

        // Volumes can pass 4 GiB uncompressed.
        zip.start_file(format!("{key}/image.npy"), options.large_file(true))?;
        npy::write(&mut *zip, series.shape(), &pixels)?;

        let mut masks = Vec::new();
        let mut mask_keys = HashSet::new();
        for linked in &image.segmentations {
            let mask = match linked.record.mask.read_aligned(&series.geometry) {
                Ok(mask) => mask,
                Err(e) => {
                    warn!("Patient {}: skipping mask {}: {}", record.patient_id, linked.organ, e);
                    warnings.push(format!("mask {} on {}: {}", linked.organ, key, e));
                    continue;
                }
            };
            let mask_key = unique_key(&sanitize_key(&linked.organ), &mut mask_keys);
            zip.start_file(format!("{key}/masks/{mask_key}.npy"), options)?;
            npy::write(&mut *zip, series.shape(), &mask)?;
            masks.push(MaskManifest {
                key: mask_key,
                organ: linked.organ.clone(),
                source: linked.record.source.clone(),
                voxels: mask.iter().filter(|&&v| v != 0).count(),
            });
        }

        let attributes = json!({
            "series_uid": series.series_uid,
            "description": series.description,
            "modality": series.modality,
            "frame_of_reference_uid": series.frame_of_reference_uid,
            "role": image.role,
            "inclusion": image.reason,
            "shape": series.shape(),
            "geometry": series.geometry,
            "header": volume.attributes(),
        });
        zip.start_file(format!("{key}/attributes.json"), options)?;
        serde_json::to_writer_pretty(&mut *zip, &attributes)?;

        debug!(
            "Patient {}: image {} ({} masks)",
            record.patient_id,
            key,
            masks.len()
        );
        images.push(ImageManifest {
            key,
            series_uid: series.series_uid.clone(),
            description: series.description.clone(),
            modality: series.modality.clone(),
            role: image.role.clone(),
            inclusion: image.reason,
            shape: series.shape(),
            masks,
        });
    }

    let manifest = PatientManifest {
        patient_id: record.patient_id.clone(),
        patient: record.patient.clone(),
        written_at: Utc::now(),
        images,
        warnings: warnings.clone(),
    };
    zip.start_file(PATIENT_MANIFEST, options)?;
    serde_json::to_writer_pretty(&mut *zip, &manifest)?;
    Ok(manifest)
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Replaces everything but alphanumerics, `-` and `_` with `_`.
pub fn sanitize_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// File-safe key of a patient identifier.
///
/// Identifiers that sanitising leaves untouched are their own key. Any other
/// identifier gets `~` and a digest of the raw identifier appended, so two
/// distinct identifiers never share an entry (`~` never survives sanitising).
pub fn entry_key(patient_id: &str) -> Result<String> {
    let key = sanitize_key(patient_id.trim());
    if key.trim_matches('_').is_empty() {
        return Err(DatasetError::InvalidKey(patient_id.to_string()));
    }
    if key == patient_id {
        return Ok(key);
    }
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, patient_id.as_bytes())
        .simple()
        .to_string();
    Ok(format!("{key}~{}", &digest[..KEY_DIGEST_LEN]))
}

fn read_patient_id(entry: &Path) -> Result<String> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(entry)?))?;
    let manifest: PatientManifest = serde_json::from_reader(archive.by_name(PATIENT_MANIFEST)?)?;
    Ok(manifest.patient_id)
}

/// Sub-entry names of a patient's images: the role, or the modality for
/// images without a named role, made unique with `_2`, `_3`, ...
pub fn image_keys(images: &[ImageAssociation]) -> Vec<String> {
    let mut taken = HashSet::new();
    images
        .iter()
        .map(|image| {
            let base = image
                .role
                .as_deref()
                .filter(|role| *role != UNFILTERED_ROLE)
                .or(image.series.modality.as_deref())
                .map(sanitize_key)
                .filter(|key| !key.trim_matches('_').is_empty())
                .unwrap_or_else(|| "image".to_string());
            unique_key(&base, &mut taken)
        })
        .collect()
}

fn unique_key(base: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

//! Grouping of a patient's raw image files into series.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ScanOptions;
use crate::dicom_reader::{ImageReader, PatientInfo, SliceHeader};
use crate::error::{DatasetError, Result};
use crate::volume::{dot, slice_normal, voxel_count, Attributes, ImageVolume, SeriesGeometry, Shape};

/// One acquired volume, immutable once catalogued.
#[derive(Debug, Clone)]
pub struct RawSeries {
    pub series_uid: String,
    pub description: Option<String>,
    pub frame_of_reference_uid: Option<String>,
    pub modality: Option<String>,
    pub orientation: Option<[f64; 6]>,
    /// Constituent files in slice order
    pub files: Vec<PathBuf>,
    pub geometry: SeriesGeometry,
    /// Header attributes of the first slice
    pub attributes: Attributes,
}

impl RawSeries {
    pub fn shape(&self) -> Shape {
        self.geometry.shape()
    }

    /// Human readable name for logs.
    pub fn label(&self) -> &str {
        self.description
            .as_deref()
            .or(self.modality.as_deref())
            .unwrap_or(&self.series_uid)
    }

    /// Pixel payload of the series, read slice by slice through `reader`.
    pub fn volume<'r>(&'r self, reader: &'r dyn ImageReader) -> SeriesVolume<'r> {
        SeriesVolume { series: self, reader }
    }
}

pub struct SeriesVolume<'r> {
    series: &'r RawSeries,
    reader: &'r dyn ImageReader,
}

impl ImageVolume for SeriesVolume<'_> {
    fn shape(&self) -> Shape {
        self.series.shape()
    }

    fn attributes(&self) -> &Attributes {
        &self.series.attributes
    }

    fn read_into(&self, out: &mut [f32]) -> Result<()> {
        let geometry = &self.series.geometry;
        let slice_len = geometry.rows * geometry.columns;
        if out.len() != voxel_count(self.shape()) || slice_len == 0 || self.series.files.len() != geometry.slices {
            return Err(DatasetError::MalformedSeries {
                series_uid: self.series.series_uid.clone(),
                reason: format!("cannot read {:?} into {} values", self.shape(), out.len()),
            });
        }

        for (file, slice) in self.series.files.iter().zip(out.chunks_exact_mut(slice_len)) {
            let pixels = self.reader.read_pixels(file)?;
            if pixels.len() != slice_len {
                return Err(DatasetError::UnsupportedPixelData {
                    path: file.clone(),
                    reason: format!("{} pixels, expected {}", pixels.len(), slice_len),
                });
            }
            slice.copy_from_slice(&pixels);
        }
        Ok(())
    }
}

/// Result of cataloguing one images directory.
#[derive(Debug, Default)]
pub struct Catalog {
    pub series: Vec<RawSeries>,
    pub patient: PatientInfo,
    /// Series groups dropped because they were inconsistent
    pub malformed: Vec<DatasetError>,
    pub unreadable_files: usize,
}

pub struct SeriesCatalog<'r> {
    reader: &'r dyn ImageReader,
    scan: ScanOptions,
}

impl<'r> SeriesCatalog<'r> {
    pub fn new(reader: &'r dyn ImageReader, scan: ScanOptions) -> Self {
        Self { reader, scan }
    }

    /// Groups the files under `images_dir` by series UID, in order of first
    /// appearance by file name.
    ///
    /// Fails when the directory cannot be walked or when it holds files but
    /// none of them is readable. Inconsistent groups are dropped into
    /// [`Catalog::malformed`] instead of failing the patient.
    pub fn collect(&self, images_dir: &Path) -> Result<Catalog> {
        let files = list_files(images_dir, self.scan.max_depth)?;
        let file_count = files.len();

        let read = |path: PathBuf| {
            let header = self.reader.read_header(&path);
            (path, header)
        };
        let results: Vec<(PathBuf, Result<SliceHeader>)> = if self.scan.parallel && file_count > 1 {
            files.into_par_iter().map(read).collect()
        } else {
            files.into_iter().map(read).collect()
        };

        let mut catalog = Catalog::default();
        let mut groups: Vec<(String, Vec<SliceHeader>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (path, result) in results {
            match result {
                Ok(header) => {
                    let slot = *index.entry(header.series_uid.clone()).or_insert_with(|| {
                        groups.push((header.series_uid.clone(), Vec::new()));
                        groups.len() - 1
                    });
                    groups[slot].1.push(header);
                }
                Err(e) => {
                    debug!("Skipping unreadable image file {:?}: {}", path, e);
                    catalog.unreadable_files += 1;
                }
            }
        }

        if file_count > 0 && catalog.unreadable_files == file_count {
            return Err(DatasetError::NoReadableImages(images_dir.to_path_buf()));
        }

        if let Some((_, slices)) = groups.first() {
            catalog.patient = slices[0].patient.clone();
        }

        for (series_uid, slices) in groups {
            match assemble_series(series_uid, slices) {
                Ok(series) => catalog.series.push(series),
                Err(e) => {
                    warn!("Dropping series in {:?}: {}", images_dir, e);
                    catalog.malformed.push(e);
                }
            }
        }

        Ok(catalog)
    }
}

pub(crate) fn list_files(dir: &Path, max_depth: usize) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(DatasetError::UnreadablePatient {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(max_depth).sort_by_file_name() {
        let entry = entry.map_err(|e| DatasetError::UnreadablePatient {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry.file_type().is_file() && !hidden {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Validates one series UID group and puts its slices in order: by position
/// along the slice normal, else by instance number, else by file name.
fn assemble_series(series_uid: String, mut slices: Vec<SliceHeader>) -> Result<RawSeries> {
    let malformed = |reason: String| DatasetError::MalformedSeries {
        series_uid: series_uid.clone(),
        reason,
    };

    let mut frames = slices.iter().filter_map(|s| s.frame_of_reference_uid.as_deref());
    if let Some(first) = frames.next() {
        if let Some(other) = frames.find(|f| *f != first) {
            return Err(malformed(format!("frames of reference {first} and {other}")));
        }
    }

    let (rows, columns) = (slices[0].rows, slices[0].columns);
    if let Some(odd) = slices.iter().find(|s| (s.rows, s.columns) != (rows, columns)) {
        return Err(malformed(format!(
            "{:?} is {}x{}, expected {}x{}",
            odd.path, odd.rows, odd.columns, rows, columns
        )));
    }

    let normal = slices[0].orientation.as_ref().map(slice_normal);
    let offsets: Option<Vec<f64>> = normal.and_then(|n| {
        slices
            .iter()
            .map(|s| s.position.map(|p| dot(n, p)))
            .collect()
    });

    let mut positions = Vec::new();
    match offsets {
        Some(offsets) => {
            let mut keyed: Vec<(f64, SliceHeader)> = offsets.into_iter().zip(slices).collect();
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
            positions = keyed.iter().map(|(offset, _)| *offset).collect();
            slices = keyed.into_iter().map(|(_, s)| s).collect();
        }
        None if slices.iter().all(|s| s.instance_number.is_some()) => {
            slices.sort_by(|a, b| {
                a.instance_number
                    .cmp(&b.instance_number)
                    .then_with(|| a.path.cmp(&b.path))
            });
        }
        None => slices.sort_by(|a, b| a.path.cmp(&b.path)),
    }

    let first = &slices[0];
    let geometry = SeriesGeometry {
        rows,
        columns,
        slices: slices.len(),
        normal,
        positions,
    };

    Ok(RawSeries {
        description: slices.iter().find_map(|s| s.description.clone()),
        frame_of_reference_uid: slices.iter().find_map(|s| s.frame_of_reference_uid.clone()),
        modality: first.modality.clone(),
        orientation: first.orientation,
        attributes: first.attributes.clone(),
        files: slices.into_iter().map(|s| s.path).collect(),
        geometry,
        series_uid,
    })
}

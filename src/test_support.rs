//! In-memory readers and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tempfile::TempDir;

use crate::association::AssociationEngine;
use crate::dicom_reader::{ImageReader, PatientInfo, SliceHeader};
use crate::error::{DatasetError, Result};
use crate::organs::OrganDictionary;
use crate::segmentation::{ReferenceUid, SegmentationReader, SegmentationRecord};
use crate::series::RawSeries;
use crate::volume::{voxel_count, Attributes, MaskVolume, SeriesGeometry, Shape};

/// Header of one fake slice.
#[derive(Debug, Clone)]
pub(crate) struct SliceSpec {
    header: SliceHeader,
    fill: f32,
}

impl SliceSpec {
    pub fn new(series_uid: &str, description: &str) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert("SeriesInstanceUID".into(), json!(series_uid));
        attributes.insert("SeriesDescription".into(), json!(description));
        Self {
            header: SliceHeader {
                series_uid: series_uid.to_string(),
                description: (!description.is_empty()).then(|| description.to_string()),
                rows: 2,
                columns: 2,
                attributes,
                ..Default::default()
            },
            fill: 0.0,
        }
    }

    /// Axial slice at `z`.
    pub fn at(mut self, z: f64) -> Self {
        self.header.orientation = Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        self.header.position = Some([0.0, 0.0, z]);
        self
    }

    pub fn instance(mut self, number: i32) -> Self {
        self.header.instance_number = Some(number);
        self
    }

    pub fn frame(mut self, frame_of_reference_uid: &str) -> Self {
        self.header.frame_of_reference_uid = Some(frame_of_reference_uid.to_string());
        self
    }

    pub fn modality(mut self, modality: &str) -> Self {
        self.header.modality = Some(modality.to_string());
        self
    }

    pub fn patient(mut self, patient_id: &str) -> Self {
        self.header.patient = PatientInfo {
            patient_id: Some(patient_id.to_string()),
            ..Default::default()
        };
        self
    }

    /// Value of every pixel of the slice.
    pub fn fill(mut self, value: f32) -> Self {
        self.fill = value;
        self
    }
}

/// [`ImageReader`] answering from registered headers. Registered files are
/// created on disk so directory walks find them.
#[derive(Debug, Default)]
pub(crate) struct FakeImageReader {
    slices: HashMap<PathBuf, SliceSpec>,
}

impl FakeImageReader {
    pub fn add(&mut self, dir: &Path, name: &str, mut spec: SliceSpec) {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, b"fake slice").unwrap();
        spec.header.path = path.clone();
        self.slices.insert(path, spec);
    }
}

impl ImageReader for FakeImageReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader> {
        self.slices
            .get(path)
            .map(|spec| spec.header.clone())
            .ok_or_else(|| DatasetError::dicom(path, "not a registered slice"))
    }

    fn read_pixels(&self, path: &Path) -> Result<Vec<f32>> {
        let spec = self
            .slices
            .get(path)
            .ok_or_else(|| DatasetError::dicom(path, "not a registered slice"))?;
        Ok(vec![spec.fill; spec.header.rows * spec.header.columns])
    }
}

/// Mask held in memory, read back only against an identical shape.
#[derive(Debug, Clone)]
pub(crate) struct DenseMask {
    shape: Shape,
    voxels: Vec<u8>,
    attributes: Attributes,
}

impl DenseMask {
    pub fn new(shape: Shape, voxels: Vec<u8>) -> Self {
        assert_eq!(voxels.len(), voxel_count(shape));
        Self {
            shape,
            voxels,
            attributes: Attributes::new(),
        }
    }

    /// Mask with only its first voxel set.
    pub fn corner(shape: Shape) -> Self {
        let mut voxels = vec![0; voxel_count(shape)];
        if let Some(first) = voxels.first_mut() {
            *first = 1;
        }
        Self::new(shape, voxels)
    }
}

impl MaskVolume for DenseMask {
    fn shape(&self) -> Option<Shape> {
        Some(self.shape)
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn read_into(&self, geometry: &SeriesGeometry, out: &mut [u8]) -> Result<()> {
        if geometry.shape() != self.shape {
            return Err(DatasetError::MaskShape {
                organ: "dense".into(),
                expected: geometry.shape(),
                found: self.shape,
            });
        }
        out.copy_from_slice(&self.voxels);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeSegmentation {
    reference: Option<ReferenceUid>,
    label: String,
    shape: Shape,
}

/// [`SegmentationReader`] producing one [`DenseMask::corner`] record per
/// registered file.
#[derive(Debug, Default)]
pub(crate) struct FakeSegmentationReader {
    files: HashMap<PathBuf, FakeSegmentation>,
}

impl FakeSegmentationReader {
    pub fn add(&mut self, dir: &Path, name: &str, reference: Option<ReferenceUid>, label: &str, shape: Shape) {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, b"fake segmentation").unwrap();
        self.files.insert(
            path,
            FakeSegmentation {
                reference,
                label: label.to_string(),
                shape,
            },
        );
    }
}

impl SegmentationReader for FakeSegmentationReader {
    fn read(&self, path: &Path) -> Result<Vec<SegmentationRecord>> {
        let fake = self.files.get(path).ok_or_else(|| DatasetError::Segmentation {
            path: path.to_path_buf(),
            reason: "not a registered segmentation".into(),
        })?;
        Ok(vec![SegmentationRecord {
            source: path.to_path_buf(),
            reference: fake.reference.clone(),
            label: Some(fake.label.clone()),
            mask: Box::new(DenseMask::corner(fake.shape)),
        }])
    }
}

pub(crate) fn fake_record(
    name: &str,
    reference: Option<ReferenceUid>,
    label: Option<&str>,
    shape: Shape,
) -> SegmentationRecord {
    SegmentationRecord {
        source: PathBuf::from(name),
        reference,
        label: label.map(str::to_string),
        mask: Box::new(DenseMask::corner(shape)),
    }
}

/// Series without files, `shape` is `[slices, rows, columns]`.
pub(crate) fn raw_series(uid: &str, description: &str, frame_of_reference_uid: Option<&str>, shape: Shape) -> RawSeries {
    RawSeries {
        series_uid: uid.to_string(),
        description: Some(description.to_string()),
        frame_of_reference_uid: frame_of_reference_uid.map(str::to_string),
        modality: None,
        orientation: None,
        files: Vec::new(),
        geometry: SeriesGeometry {
            slices: shape[0],
            rows: shape[1],
            columns: shape[2],
            ..Default::default()
        },
        attributes: Attributes::new(),
    }
}

/// Little-endian NIfTI-1 header for `uint8` voxels, `dims` is `[nx, ny, nz]`.
fn nifti_header(dims: [i16; 3], magic: &[u8; 4], vox_offset: f32) -> Vec<u8> {
    let mut header = vec![0u8; 352];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());
    header[40..42].copy_from_slice(&3i16.to_le_bytes());
    for (axis, dim) in dims.iter().enumerate() {
        header[42 + 2 * axis..44 + 2 * axis].copy_from_slice(&dim.to_le_bytes());
    }
    header[70..72].copy_from_slice(&2i16.to_le_bytes());
    header[72..74].copy_from_slice(&8i16.to_le_bytes());
    for axis in 0..4 {
        header[76 + 4 * axis..80 + 4 * axis].copy_from_slice(&1f32.to_le_bytes());
    }
    header[108..112].copy_from_slice(&vox_offset.to_le_bytes());
    header[112..116].copy_from_slice(&1f32.to_le_bytes());
    header[344..348].copy_from_slice(magic);
    header
}

/// Writes a single-file NIfTI-1 volume of `uint8` voxels, gzipped when the
/// name ends in `.gz`.
pub(crate) fn write_nifti(path: &Path, dims: [i16; 3], voxels: &[u8]) {
    let mut bytes = nifti_header(dims, b"n+1\0", 352.0);
    bytes.extend_from_slice(voxels);

    if path.to_string_lossy().ends_with(".gz") {
        let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();
    } else {
        fs::write(path, bytes).unwrap();
    }
}

/// Writes a `.hdr`/`.img` pair; `header_path` names the `.hdr` file.
pub(crate) fn write_nifti_pair(header_path: &Path, dims: [i16; 3], voxels: &[u8]) {
    let mut header = nifti_header(dims, b"ni1\0", 0.0);
    header.truncate(348);
    fs::write(header_path, header).unwrap();
    fs::write(header_path.with_extension("img"), voxels).unwrap();
}

/// Patient tree under a temporary root, with readers that know its files.
/// Each patient gets 2x2 axial slices 2.5 apart; slice `i` is filled with `i`.
pub(crate) struct CohortBuilder {
    root: TempDir,
    images: FakeImageReader,
    segmentations: FakeSegmentationReader,
    organs: OrganDictionary,
}

impl CohortBuilder {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            images: FakeImageReader::default(),
            segmentations: FakeSegmentationReader::default(),
            organs: OrganDictionary::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn patient_dir(&self, patient_id: &str) -> PathBuf {
        self.root.path().join(patient_id)
    }

    pub fn patient(&mut self, patient_id: &str) -> PatientBuilder<'_> {
        let dir = self.patient_dir(patient_id);
        fs::create_dir_all(&dir).unwrap();
        PatientBuilder {
            patient_id: patient_id.to_string(),
            dir,
            slices: HashMap::new(),
            cohort: self,
        }
    }

    pub fn images(&self) -> &FakeImageReader {
        &self.images
    }

    pub fn segmentations(&self) -> &FakeSegmentationReader {
        &self.segmentations
    }

    pub fn engine(&self) -> AssociationEngine<'_> {
        AssociationEngine::new(&self.images, &self.segmentations, &self.organs)
    }
}

pub(crate) struct PatientBuilder<'c> {
    cohort: &'c mut CohortBuilder,
    patient_id: String,
    dir: PathBuf,
    slices: HashMap<String, usize>,
}

impl PatientBuilder<'_> {
    pub fn series(mut self, uid: &str, description: &str, slices: usize) -> Self {
        let images = self.dir.join("images");
        for i in 0..slices {
            let spec = SliceSpec::new(uid, description)
                .at(i as f64 * 2.5)
                .instance(i as i32 + 1)
                .modality("CT")
                .patient(&self.patient_id)
                .fill(i as f32);
            self.cohort.images.add(&images, &format!("{uid}_{i:03}.dcm"), spec);
        }
        self.slices.insert(uid.to_string(), slices);
        self
    }

    /// Segmentation shaped like the series it references, when known.
    pub fn segmentation(self, name: &str, reference: ReferenceUid, label: &str) -> Self {
        let slices = self.slices.get(reference.uid()).copied().unwrap_or(1);
        let dir = self.dir.join("segmentations");
        self.cohort
            .segmentations
            .add(&dir, name, Some(reference), label, [slices, 2, 2]);
        self
    }

    /// Image file no reader understands.
    pub fn junk(self, name: &str) -> Self {
        let images = self.dir.join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join(name), b"not an image").unwrap();
        self
    }
}

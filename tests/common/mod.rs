#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dicom_core::value::{DataSetSequence, PrimitiveValue};
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use flate2::write::GzEncoder;
use flate2::Compression;

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.4";

/// One synthetic series, 2x3 pixels per slice, axial, 2.5mm apart.
/// Stored values are `1024 + 10 * slice + pixel` with a -1024 intercept.
pub struct SeriesFixture<'a> {
    pub patient_id: &'a str,
    pub series_uid: &'a str,
    pub description: &'a str,
    pub modality: &'a str,
    pub frame_of_reference_uid: &'a str,
    pub slices: usize,
}

pub const ROWS: usize = 2;
pub const COLUMNS: usize = 3;

impl SeriesFixture<'_> {
    pub fn shape(&self) -> [usize; 3] {
        [self.slices, ROWS, COLUMNS]
    }

    /// Rescaled values of the whole volume in slice order.
    pub fn expected_pixels(&self) -> Vec<f32> {
        (0..self.slices)
            .flat_map(|slice| (0..ROWS * COLUMNS).map(move |pixel| (10 * slice + pixel) as f32))
            .collect()
    }

    /// Writes the slices in reverse so ordering has to come from positions.
    pub fn write(&self, images_dir: &Path) {
        fs::create_dir_all(images_dir).unwrap();
        for slice in (0..self.slices).rev() {
            let sop_uid = format!("{}.{}", self.series_uid, slice + 1);
            let pixels: Vec<u16> = (0..ROWS * COLUMNS)
                .map(|pixel| (1024 + 10 * slice + pixel) as u16)
                .collect();

            let obj = InMemDicomObject::from_element_iter([
                DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, CT_IMAGE_STORAGE)),
                DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid.as_str())),
                DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, self.modality)),
                DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, dicom_value!(Str, self.description)),
                DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^Jane")),
                DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, self.patient_id)),
                DataElement::new(tags::PATIENT_SEX, VR::CS, dicom_value!(Str, "F")),
                DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, self.series_uid)),
                DataElement::new(
                    tags::FRAME_OF_REFERENCE_UID,
                    VR::UI,
                    dicom_value!(Str, self.frame_of_reference_uid),
                ),
                DataElement::new(
                    tags::INSTANCE_NUMBER,
                    VR::IS,
                    dicom_value!(Str, (slice + 1).to_string().as_str()),
                ),
                DataElement::new(
                    tags::IMAGE_POSITION_PATIENT,
                    VR::DS,
                    dicom_value!(Strs, ["0", "0", (slice as f64 * 2.5).to_string()]),
                ),
                DataElement::new(
                    tags::IMAGE_ORIENTATION_PATIENT,
                    VR::DS,
                    dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
                ),
                DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
                DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "MONOCHROME2")),
                DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [ROWS as u16])),
                DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [COLUMNS as u16])),
                DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])),
                DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])),
                DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [15])),
                DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
                DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, dicom_value!(Str, "-1024")),
                DataElement::new(tags::RESCALE_SLOPE, VR::DS, dicom_value!(Str, "1")),
                DataElement::new(
                    tags::PIXEL_DATA,
                    VR::OW,
                    PrimitiveValue::U16(pixels.into()),
                ),
            ]);

            let file = obj
                .with_meta(
                    FileMetaTableBuilder::new()
                        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                        .media_storage_sop_instance_uid(sop_uid.as_str()),
                )
                .unwrap();
            file.write_to_file(images_dir.join(format!("{}_{:03}.dcm", self.series_uid, slice)))
                .unwrap();
        }
    }
}

/// Signed 16-bit CT image of `frames` frames of ROWS x COLUMNS, with
/// RescaleSlope 2 and RescaleIntercept 1.
pub fn write_signed_image(path: &Path, stored: &[i16], frames: u16) {
    assert_eq!(stored.len(), frames as usize * ROWS * COLUMNS);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let sop_uid = "1.2.826.0.1.8.1";
    let samples: Vec<u16> = stored.iter().map(|&v| v as u16).collect();

    let mut obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid)),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.826.0.1.8")),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "MONOCHROME2")),
        DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [ROWS as u16])),
        DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [COLUMNS as u16])),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])),
        DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])),
        DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [15])),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, dicom_value!(Str, "1")),
        DataElement::new(tags::RESCALE_SLOPE, VR::DS, dicom_value!(Str, "2")),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(samples.into())),
    ]);
    if frames > 1 {
        obj.put(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            dicom_value!(Str, frames.to_string().as_str()),
        ));
    }

    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_uid),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

/// A BINARY DICOM SEG object over a [`SeriesFixture`] grid, one set pixel
/// per frame.
pub struct SegFixture {
    pub modality: String,
    /// Series named in ReferencedSeriesSequence; without it only the frame
    /// of reference is left to link on
    pub referenced_series_uid: Option<String>,
    pub frame_of_reference_uid: String,
    pub rows: u16,
    pub columns: u16,
    /// NumberOfFrames as written; defaults to the number of frames
    pub number_of_frames: Option<String>,
    /// (SegmentNumber, SegmentLabel)
    pub segments: Vec<(u16, String)>,
    /// (ReferencedSegmentNumber, slice index, set pixel) per frame
    pub frames: Vec<(u16, usize, usize)>,
}

impl SegFixture {
    /// "Liver" on the first and last slice of `series`, "Spleen" on the
    /// second, frames interleaved.
    pub fn two_segments(series: &SeriesFixture<'_>) -> Self {
        let last = series.slices - 1;
        SegFixture {
            modality: "SEG".into(),
            referenced_series_uid: Some(series.series_uid.into()),
            frame_of_reference_uid: series.frame_of_reference_uid.into(),
            rows: ROWS as u16,
            columns: COLUMNS as u16,
            number_of_frames: None,
            segments: vec![(1, "Liver".into()), (2, "Spleen".into())],
            frames: vec![(1, 0, 0), (2, 1, 3), (1, last, ROWS * COLUMNS - 1)],
        }
    }

    /// Mask of `segment` over a series of `slices` slices.
    pub fn expected_mask(&self, segment: u16, slices: usize) -> Vec<u8> {
        let per_slice = ROWS * COLUMNS;
        let mut voxels = vec![0u8; slices * per_slice];
        for &(number, slice, pixel) in &self.frames {
            if number == segment {
                voxels[slice * per_slice + pixel] = 1;
            }
        }
        voxels
    }

    /// Frames packed on the ROWS x COLUMNS grid, whatever Rows/Columns say.
    fn packed_pixels(&self) -> Vec<u8> {
        let per_frame = ROWS * COLUMNS;
        let mut bytes = vec![0u8; (self.frames.len() * per_frame).div_ceil(8)];
        for (frame, &(_, _, pixel)) in self.frames.iter().enumerate() {
            let bit = frame * per_frame + pixel;
            bytes[bit / 8] |= 1 << (bit % 8);
        }
        if bytes.len() % 2 == 1 {
            bytes.push(0);
        }
        bytes
    }

    pub fn write(&self, path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let sop_uid = "1.2.826.0.1.7.1";

        let segments: Vec<InMemDicomObject> = self
            .segments
            .iter()
            .map(|(number, label)| {
                InMemDicomObject::from_element_iter([
                    DataElement::new(tags::SEGMENT_NUMBER, VR::US, dicom_value!(U16, [*number])),
                    DataElement::new(tags::SEGMENT_LABEL, VR::LO, dicom_value!(Str, label.as_str())),
                ])
            })
            .collect();

        let per_frame: Vec<InMemDicomObject> = self
            .frames
            .iter()
            .map(|&(segment, slice, _)| {
                let identification = InMemDicomObject::from_element_iter([DataElement::new(
                    tags::REFERENCED_SEGMENT_NUMBER,
                    VR::US,
                    dicom_value!(U16, [segment]),
                )]);
                let position = InMemDicomObject::from_element_iter([DataElement::new(
                    tags::IMAGE_POSITION_PATIENT,
                    VR::DS,
                    dicom_value!(Strs, ["0", "0", (slice as f64 * 2.5).to_string()]),
                )]);
                InMemDicomObject::from_element_iter([
                    DataElement::new(
                        tags::SEGMENT_IDENTIFICATION_SEQUENCE,
                        VR::SQ,
                        DataSetSequence::from(vec![identification]),
                    ),
                    DataElement::new(
                        tags::PLANE_POSITION_SEQUENCE,
                        VR::SQ,
                        DataSetSequence::from(vec![position]),
                    ),
                ])
            })
            .collect();

        let number_of_frames = self
            .number_of_frames
            .clone()
            .unwrap_or_else(|| self.frames.len().to_string());

        let mut obj = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, SEGMENTATION_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid)),
            DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, self.modality.as_str())),
            DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, dicom_value!(Str, "Organs")),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.826.0.1.7")),
            DataElement::new(
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                dicom_value!(Str, self.frame_of_reference_uid.as_str()),
            ),
            DataElement::new(tags::SEGMENTATION_TYPE, VR::CS, dicom_value!(Str, "BINARY")),
            DataElement::new(tags::NUMBER_OF_FRAMES, VR::IS, dicom_value!(Str, number_of_frames.as_str())),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "MONOCHROME2")),
            DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [self.rows])),
            DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [self.columns])),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [1])),
            DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [0])),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
            DataElement::new(tags::SEGMENT_SEQUENCE, VR::SQ, DataSetSequence::from(segments)),
            DataElement::new(
                tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(per_frame),
            ),
            DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::U8(self.packed_pixels().into())),
        ]);
        if let Some(series_uid) = &self.referenced_series_uid {
            let referenced = InMemDicomObject::from_element_iter([DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, series_uid.as_str()),
            )]);
            obj.put(DataElement::new(
                tags::REFERENCED_SERIES_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![referenced]),
            ));
        }

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(SEGMENTATION_STORAGE)
                    .media_storage_sop_instance_uid(sop_uid),
            )
            .unwrap();
        file.write_to_file(path).unwrap();
    }
}

/// Writes a single-file little-endian NIfTI-1 `uint8` mask, gzipped when the
/// name ends in `.gz`. `dims` is `[nx, ny, nz]`.
pub fn write_nifti(path: &Path, dims: [i16; 3], voxels: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut bytes = vec![0u8; 352];
    bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
    bytes[40..42].copy_from_slice(&3i16.to_le_bytes());
    for (axis, dim) in dims.iter().enumerate() {
        bytes[42 + 2 * axis..44 + 2 * axis].copy_from_slice(&dim.to_le_bytes());
    }
    bytes[70..72].copy_from_slice(&2i16.to_le_bytes());
    bytes[72..74].copy_from_slice(&8i16.to_le_bytes());
    for axis in 0..4 {
        bytes[76 + 4 * axis..80 + 4 * axis].copy_from_slice(&1f32.to_le_bytes());
    }
    bytes[108..112].copy_from_slice(&352f32.to_le_bytes());
    bytes[112..116].copy_from_slice(&1f32.to_le_bytes());
    bytes[344..348].copy_from_slice(b"n+1\0");
    bytes.extend_from_slice(voxels);

    if path.to_string_lossy().ends_with(".gz") {
        let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();
    } else {
        fs::write(path, bytes).unwrap();
    }
}

/// Mask over a fixture series with one voxel set in each slice.
pub fn diagonal_mask(series: &SeriesFixture<'_>) -> Vec<u8> {
    let per_slice = ROWS * COLUMNS;
    let mut voxels = vec![0u8; series.slices * per_slice];
    for slice in 0..series.slices {
        voxels[slice * per_slice + slice % per_slice] = 1;
    }
    voxels
}

pub fn images_dir(root: &Path, patient: &str) -> PathBuf {
    root.join(patient).join("images")
}

pub fn segmentations_dir(root: &Path, patient: &str) -> PathBuf {
    root.join(patient).join("segmentations")
}

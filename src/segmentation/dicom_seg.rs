//! DICOM Segmentation objects (Modality `SEG`).
//!
//! One record is produced per item of the SegmentSequence. Frames are
//! assigned to segments through the per-frame SegmentIdentificationSequence
//! and placed on the referenced series by their PlanePositionSequence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom::object::{InMemDicomObject, OpenFileOptions};
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use serde_json::json;
use tracing::warn;

use super::{ReferenceUid, SegmentationRecord};
use crate::dicom_reader::{get_floats, get_int, get_str, get_usize};
use crate::error::{DatasetError, Result};
use crate::volume::{voxel_count, Attributes, MaskVolume, SeriesGeometry, Shape};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SegFrame {
    /// Index of the frame inside the pixel data
    pub index: usize,
    pub position: Option<[f64; 3]>,
}

/// Frames of one segment, sharing the pixel data of their file.
#[derive(Debug)]
pub struct DicomSegMask {
    path: PathBuf,
    rows: usize,
    columns: usize,
    fractional: bool,
    frames: Vec<SegFrame>,
    pixels: Arc<Vec<u8>>,
    attributes: Attributes,
}

fn items(obj: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.items())
        .unwrap_or(&[])
}

/// Bits of pixel data needed for `frame_count` frames, `None` on overflow.
fn frame_bits(frame_count: usize, rows: usize, columns: usize, fractional: bool) -> Option<usize> {
    frame_count
        .checked_mul(rows)?
        .checked_mul(columns)?
        .checked_mul(if fractional { 8 } else { 1 })
}

pub fn read_records(path: &Path) -> Result<Vec<SegmentationRecord>> {
    let obj = OpenFileOptions::new()
        .open_file(path)
        .map_err(|e| DatasetError::dicom(path, e))?;
    let invalid = |reason: &str| DatasetError::Segmentation {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if get_str(&obj, tags::MODALITY).as_deref() != Some("SEG") {
        return Err(invalid("not a DICOM SEG object"));
    }

    let reference = items(&obj, tags::REFERENCED_SERIES_SEQUENCE)
        .iter()
        .find_map(|item| get_str(item, tags::SERIES_INSTANCE_UID))
        .map(ReferenceUid::Series)
        .or_else(|| get_str(&obj, tags::FRAME_OF_REFERENCE_UID).map(ReferenceUid::FrameOfReference));

    let rows = get_usize(&obj, tags::ROWS).unwrap_or(0);
    let columns = get_usize(&obj, tags::COLUMNS).unwrap_or(0);
    let frame_count = get_usize(&obj, tags::NUMBER_OF_FRAMES).unwrap_or(1);
    let fractional = get_str(&obj, tags::SEGMENTATION_TYPE).as_deref() == Some("FRACTIONAL");
    if rows == 0 || columns == 0 {
        return Err(invalid("missing Rows/Columns"));
    }

    let pixels = obj
        .element_opt(tags::PIXEL_DATA)
        .ok()
        .flatten()
        .and_then(|e| e.to_bytes().ok())
        .map(|bytes| bytes.into_owned())
        .ok_or_else(|| invalid("no pixel data"))?;
    let needed_bits = frame_bits(frame_count, rows, columns, fractional)
        .ok_or_else(|| invalid("NumberOfFrames x Rows x Columns overflows"))?;
    if pixels.len().saturating_mul(8) < needed_bits {
        return Err(invalid("pixel data shorter than NumberOfFrames x Rows x Columns"));
    }
    let pixels = Arc::new(pixels);

    let per_frame = items(&obj, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE);
    let frame_segments: Vec<(i64, SegFrame)> = (0..frame_count)
        .map(|index| {
            let group = per_frame.get(index);
            let segment = group
                .and_then(|g| items(g, tags::SEGMENT_IDENTIFICATION_SEQUENCE).first())
                .and_then(|s| get_int(s, tags::REFERENCED_SEGMENT_NUMBER))
                .unwrap_or(1);
            let position = group
                .and_then(|g| items(g, tags::PLANE_POSITION_SEQUENCE).first())
                .and_then(|p| get_floats::<3>(p, tags::IMAGE_POSITION_PATIENT));
            (segment, SegFrame { index, position })
        })
        .collect();

    let mut segments: Vec<(i64, Option<String>)> = items(&obj, tags::SEGMENT_SEQUENCE)
        .iter()
        .map(|item| {
            let number = get_int(item, tags::SEGMENT_NUMBER).unwrap_or(1);
            (number, get_str(item, tags::SEGMENT_LABEL))
        })
        .collect();
    if segments.is_empty() {
        segments.push((1, get_str(&obj, tags::SERIES_DESCRIPTION)));
    }

    let records = segments
        .into_iter()
        .filter_map(|(number, label)| {
            let frames: Vec<SegFrame> = frame_segments
                .iter()
                .filter(|(segment, _)| *segment == number)
                .map(|(_, frame)| frame.clone())
                .collect();
            if frames.is_empty() {
                warn!("Segment {} in {:?} has no frames", number, path);
                return None;
            }

            let mut attributes = Attributes::new();
            attributes.insert("format".into(), json!("dicom-seg"));
            attributes.insert("segment_number".into(), json!(number));
            attributes.insert("segmentation_type".into(), json!(if fractional { "FRACTIONAL" } else { "BINARY" }));
            attributes.insert("frames".into(), json!(frames.len()));

            Some(SegmentationRecord {
                source: path.to_path_buf(),
                reference: reference.clone(),
                label,
                mask: Box::new(DicomSegMask {
                    path: path.to_path_buf(),
                    rows,
                    columns,
                    fractional,
                    frames,
                    pixels: Arc::clone(&pixels),
                    attributes,
                }),
            })
        })
        .collect();

    Ok(records)
}

impl DicomSegMask {
    #[cfg(test)]
    pub(crate) fn from_parts(
        rows: usize,
        columns: usize,
        fractional: bool,
        frames: Vec<SegFrame>,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            path: PathBuf::from("test.dcm"),
            rows,
            columns,
            fractional,
            frames,
            pixels: Arc::new(pixels),
            attributes: Attributes::new(),
        }
    }

    fn is_set(&self, frame: usize, pixel: usize) -> bool {
        let index = frame * self.rows * self.columns + pixel;
        if self.fractional {
            self.pixels.get(index).is_some_and(|&v| v > 0)
        } else {
            self.pixels
                .get(index / 8)
                .is_some_and(|&byte| (byte >> (index % 8)) & 1 == 1)
        }
    }

    /// Target slice for every frame: by position when both sides have one,
    /// otherwise one frame per slice in stored order.
    fn placement(&self, geometry: &SeriesGeometry) -> Result<Vec<Option<usize>>> {
        let positioned = !geometry.positions.is_empty()
            && geometry.normal.is_some()
            && self.frames.iter().all(|f| f.position.is_some());

        if positioned {
            return Ok(self
                .frames
                .iter()
                .map(|frame| {
                    let slice = frame
                        .position
                        .and_then(|p| geometry.project(p))
                        .and_then(|offset| geometry.nearest_slice(offset));
                    if slice.is_none() {
                        warn!("Frame {} of {:?} lies outside the series", frame.index, self.path);
                    }
                    slice
                })
                .collect());
        }

        if self.frames.len() == geometry.slices {
            return Ok((0..self.frames.len()).map(Some).collect());
        }

        Err(self.shape_error(geometry))
    }

    fn shape_error(&self, geometry: &SeriesGeometry) -> DatasetError {
        DatasetError::MaskShape {
            organ: self.path.display().to_string(),
            expected: geometry.shape(),
            found: [self.frames.len(), self.rows, self.columns],
        }
    }
}

impl MaskVolume for DicomSegMask {
    fn shape(&self) -> Option<Shape> {
        Some([self.frames.len(), self.rows, self.columns])
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn read_into(&self, geometry: &SeriesGeometry, out: &mut [u8]) -> Result<()> {
        if (self.rows, self.columns) != (geometry.rows, geometry.columns)
            || out.len() != voxel_count(geometry.shape())
        {
            return Err(self.shape_error(geometry));
        }

        let placement = self.placement(geometry)?;
        let frame_len = self.rows * self.columns;
        out.fill(0);
        for (frame, slice) in self.frames.iter().zip(placement) {
            let Some(slice) = slice else { continue };
            let target = &mut out[slice * frame_len..(slice + 1) * frame_len];
            for (pixel, voxel) in target.iter_mut().enumerate() {
                if self.is_set(frame.index, pixel) {
                    *voxel = 1;
                }
            }
        }
        Ok(())
    }
}

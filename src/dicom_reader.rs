//! DICOM image reading: slice headers for cataloguing and rescaled pixels
//! for archiving.

use std::path::{Path, PathBuf};

use dicom::pixeldata::PixelDecoder;
use dicom_core::dictionary::DataDictionary;
use dicom_core::header::Header;
use dicom_core::value::{PrimitiveValue, Value};
use dicom_core::{Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::{FileDicomObject, InMemDicomObject, OpenFileOptions};
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};
use crate::volume::Attributes;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PatientInfo {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub patient_age: Option<String>,
}

/// Identifying metadata of one image file.
#[derive(Debug, Clone, Default)]
pub struct SliceHeader {
    pub path: PathBuf,
    pub series_uid: String,
    pub description: Option<String>,
    pub frame_of_reference_uid: Option<String>,
    pub modality: Option<String>,
    pub orientation: Option<[f64; 6]>,
    pub position: Option<[f64; 3]>,
    pub instance_number: Option<i32>,
    pub rows: usize,
    pub columns: usize,
    pub patient: PatientInfo,
    pub attributes: Attributes,
}

/// Parser for raw image files.
pub trait ImageReader: Sync {
    fn read_header(&self, path: &Path) -> Result<SliceHeader>;

    /// Pixels of a single slice, rescaled, `rows * columns` values.
    fn read_pixels(&self, path: &Path) -> Result<Vec<f32>>;
}

/// [`ImageReader`] backed by `dicom-object`.
#[derive(Debug, Clone, Default)]
pub struct DicomImageReader {
    /// Keep private (odd group) tags in header attributes
    pub include_private: bool,
}

impl DicomImageReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, path: &Path) -> Result<FileDicomObject<InMemDicomObject>> {
        OpenFileOptions::new()
            .open_file(path)
            .map_err(|e| DatasetError::dicom(path, e))
    }

    fn collect_attributes(&self, obj: &InMemDicomObject) -> Attributes {
        let mut attributes = Attributes::new();
        for element in obj.iter() {
            let tag = element.tag();
            if tag == tags::PIXEL_DATA || element.vr() == VR::SQ {
                continue;
            }
            if !self.include_private && tag.group() % 2 == 1 {
                continue;
            }
            let key = StandardDataDictionary
                .by_tag(tag)
                .map(|entry| entry.alias.to_string())
                .unwrap_or_else(|| format!("({:04X},{:04X})", tag.group(), tag.element()));
            if let Value::Primitive(primitive) = element.value() {
                attributes.insert(key, primitive_to_json(primitive));
            }
        }
        attributes
    }
}

impl ImageReader for DicomImageReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader> {
        let obj = self.open(path)?;

        let series_uid = get_str(&obj, tags::SERIES_INSTANCE_UID)
            .ok_or_else(|| DatasetError::dicom(path, "missing SeriesInstanceUID"))?;

        Ok(SliceHeader {
            path: path.to_path_buf(),
            series_uid,
            description: get_str(&obj, tags::SERIES_DESCRIPTION),
            frame_of_reference_uid: get_str(&obj, tags::FRAME_OF_REFERENCE_UID),
            modality: get_str(&obj, tags::MODALITY),
            orientation: get_floats::<6>(&obj, tags::IMAGE_ORIENTATION_PATIENT),
            position: get_floats::<3>(&obj, tags::IMAGE_POSITION_PATIENT),
            instance_number: get_int(&obj, tags::INSTANCE_NUMBER).and_then(|v| i32::try_from(v).ok()),
            rows: get_usize(&obj, tags::ROWS).unwrap_or(0),
            columns: get_usize(&obj, tags::COLUMNS).unwrap_or(0),
            patient: extract_patient_info(&obj),
            attributes: self.collect_attributes(&obj),
        })
    }

    fn read_pixels(&self, path: &Path) -> Result<Vec<f32>> {
        let obj = self.open(path)?;
        let unsupported = |reason: String| DatasetError::UnsupportedPixelData {
            path: path.to_path_buf(),
            reason,
        };

        let decoded = obj
            .decode_pixel_data()
            .map_err(|e| unsupported(format!("failed to decode pixel data: {e}")))?;
        if decoded.samples_per_pixel() != 1 {
            return Err(unsupported(format!(
                "{} samples per pixel",
                decoded.samples_per_pixel()
            )));
        }
        if decoded.number_of_frames() != 1 {
            return Err(unsupported(format!("{} frames in one file", decoded.number_of_frames())));
        }

        // Modality LUT (rescale slope and intercept) is applied on conversion.
        let pixels: Vec<f32> = decoded
            .to_vec()
            .map_err(|e| unsupported(format!("failed to convert pixel data: {e}")))?;

        let expected = decoded.rows() as usize * decoded.columns() as usize;
        if pixels.len() != expected {
            return Err(unsupported(format!(
                "expected {expected} samples for one frame, found {}",
                pixels.len()
            )));
        }
        Ok(pixels)
    }
}

pub(crate) fn get_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn get_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_int::<i64>().ok())
}

pub(crate) fn get_usize(obj: &InMemDicomObject, tag: Tag) -> Option<usize> {
    get_int(obj, tag).and_then(|v| usize::try_from(v).ok())
}

pub(crate) fn get_floats<const N: usize>(obj: &InMemDicomObject, tag: Tag) -> Option<[f64; N]> {
    let values = obj
        .element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_multi_float64().ok())?;
    values.get(..N)?.try_into().ok()
}

fn extract_patient_info(obj: &InMemDicomObject) -> PatientInfo {
    PatientInfo {
        patient_id: get_str(obj, tags::PATIENT_ID),
        patient_name: get_str(obj, tags::PATIENT_NAME),
        patient_birth_date: get_str(obj, tags::PATIENT_BIRTH_DATE),
        patient_sex: get_str(obj, tags::PATIENT_SEX),
        patient_age: get_str(obj, tags::PATIENT_AGE),
    }
}

/// Converts a primitive element value into JSON, collapsing single values.
pub fn primitive_to_json(primitive: &PrimitiveValue) -> serde_json::Value {
    use serde_json::Value as Json;

    fn collapse<T, F: Fn(&T) -> Json>(vals: &[T], f: F) -> Json {
        if vals.len() == 1 {
            f(&vals[0])
        } else {
            Json::Array(vals.iter().map(f).collect())
        }
    }

    match primitive {
        PrimitiveValue::Empty => Json::Null,
        PrimitiveValue::U8(vals) => collapse(vals, |&v| Json::Number(v.into())),
        PrimitiveValue::U16(vals) => collapse(vals, |&v| Json::Number(v.into())),
        PrimitiveValue::U32(vals) => collapse(vals, |&v| Json::Number(v.into())),
        PrimitiveValue::I16(vals) => collapse(vals, |&v| Json::Number(v.into())),
        PrimitiveValue::I32(vals) => collapse(vals, |&v| Json::Number(v.into())),
        PrimitiveValue::F32(vals) => collapse(vals, |&v| serde_json::json!(v)),
        PrimitiveValue::F64(vals) => collapse(vals, |&v| serde_json::json!(v)),
        PrimitiveValue::Str(s) => Json::String(s.trim_end_matches('\0').trim().to_string()),
        PrimitiveValue::Strs(strs) => {
            collapse(strs, |s| Json::String(s.trim_end_matches('\0').trim().to_string()))
        }
        PrimitiveValue::Tags(tags) => Json::Array(
            tags.iter()
                .map(|tag| Json::String(format!("({:04X},{:04X})", tag.group(), tag.element())))
                .collect(),
        ),
        PrimitiveValue::Date(dates) => collapse(dates, |d| Json::String(d.to_string())),
        PrimitiveValue::Time(times) => collapse(times, |t| Json::String(t.to_string())),
        PrimitiveValue::DateTime(datetimes) => collapse(datetimes, |dt| Json::String(dt.to_string())),
        _ => Json::String(format!("{:?}", primitive)),
    }
}

//! NIfTI-1 masks named `<reference uid>_<label>.nii[.gz]`, or a `.hdr`/`.img`
//! pair with the same stem.
//!
//! Only the header is read when the record is built. Voxels are decoded
//! through the `nifti` crate when the mask is aligned onto its series. The
//! x, y and z axes map to columns, rows and slices; orientation matrices are
//! not applied.

use std::path::{Path, PathBuf};

use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use serde_json::json;

use super::{strip_extension, ReferenceUid, SegmentationRecord};
use crate::error::{DatasetError, Result};
use crate::volume::{voxel_count, Attributes, MaskVolume, SeriesGeometry, Shape};

fn lower_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_nifti(path: &Path) -> bool {
    let name = lower_name(path);
    [".nii", ".nii.gz", ".hdr", ".hdr.gz"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Voxel file of a two-file pair; read through its header instead.
pub fn is_image_companion(path: &Path) -> bool {
    let name = lower_name(path);
    name.ends_with(".img") || name.ends_with(".img.gz")
}

/// Splits a file name into its reference UID and label. The prefix before
/// the first underscore counts as a UID only if it is made of digits and
/// dots; otherwise the whole stem is the label.
pub fn parse_file_name(path: &Path) -> (Option<ReferenceUid>, Option<String>) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = strip_extension(&name);

    if let Some((prefix, label)) = stem.split_once('_') {
        let is_uid = prefix.contains('.') && prefix.chars().all(|c| c.is_ascii_digit() || c == '.');
        if is_uid {
            let label = (!label.is_empty()).then(|| label.to_string());
            return (Some(ReferenceUid::Unqualified(prefix.to_string())), label);
        }
    }
    let label = (!stem.is_empty()).then(|| stem.to_string());
    (None, label)
}

pub fn read_record(path: &Path) -> Result<SegmentationRecord> {
    let (reference, label) = parse_file_name(path);
    let mask = NiftiMask::open(path)?;
    Ok(SegmentationRecord {
        source: path.to_path_buf(),
        reference,
        label,
        mask: Box::new(mask),
    })
}

/// `[slices, rows, columns]` of a header; volumes with more than one time
/// point or component are refused.
fn header_shape(header: &NiftiHeader) -> std::result::Result<Shape, String> {
    let ndim = header.dim[0] as usize;
    if !(1..=7).contains(&ndim) {
        return Err(format!("dim[0] = {ndim}"));
    }
    let extent = |axis: usize| if axis <= ndim { header.dim[axis] as usize } else { 1 };
    if (4..=ndim).any(|axis| extent(axis) > 1) {
        return Err(format!("{ndim}-dimensional masks are not supported"));
    }
    let (nx, ny, nz) = (extent(1), extent(2), extent(3));
    if nx == 0 || ny == 0 || nz == 0 {
        return Err(format!("empty dimensions {nx}x{ny}x{nz}"));
    }
    Ok([nz, ny, nx])
}

/// Lazily decoded NIfTI mask.
#[derive(Debug)]
pub struct NiftiMask {
    path: PathBuf,
    shape: Shape,
    attributes: Attributes,
}

impl NiftiMask {
    pub fn open(path: &Path) -> Result<Self> {
        let invalid = |reason: String| DatasetError::Nifti {
            path: path.to_path_buf(),
            reason,
        };
        let header = NiftiHeader::from_file(path).map_err(|e| invalid(e.to_string()))?;
        let shape = header_shape(&header).map_err(invalid)?;

        let mut attributes = Attributes::new();
        attributes.insert("format".into(), json!("nifti1"));
        attributes.insert("datatype".into(), json!(header.datatype));
        attributes.insert("dims".into(), json!([shape[2], shape[1], shape[0]]));
        attributes.insert("pixdim".into(), json!(&header.pixdim[1..4]));

        Ok(Self {
            path: path.to_path_buf(),
            shape,
            attributes,
        })
    }

    /// Decodes the volume into 0/1 voxels in slice, row, column order.
    fn read_voxels(&self) -> Result<Vec<u8>> {
        let invalid = |reason: String| DatasetError::Nifti {
            path: self.path.clone(),
            reason,
        };
        let volume = ReaderOptions::new()
            .read_file(&self.path)
            .map_err(|e| invalid(e.to_string()))?
            .into_volume();
        let array = volume
            .into_ndarray::<f32>()
            .map_err(|e| invalid(e.to_string()))?;

        // Indexed [x, y, z]; reversed axes iterate with x fastest.
        let voxels: Vec<u8> = array
            .t()
            .iter()
            .map(|&v| u8::from(v != 0.0 && !v.is_nan()))
            .collect();
        if voxels.len() != voxel_count(self.shape) {
            return Err(invalid(format!(
                "{} voxels decoded, header promises {:?}",
                voxels.len(),
                self.shape
            )));
        }
        Ok(voxels)
    }
}

impl MaskVolume for NiftiMask {
    fn shape(&self) -> Option<Shape> {
        Some(self.shape)
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn read_into(&self, geometry: &SeriesGeometry, out: &mut [u8]) -> Result<()> {
        if self.shape != geometry.shape() {
            return Err(DatasetError::MaskShape {
                organ: self.path.display().to_string(),
                expected: geometry.shape(),
                found: self.shape,
            });
        }
        let voxels = self.read_voxels()?;
        out.copy_from_slice(&voxels);
        Ok(())
    }
}

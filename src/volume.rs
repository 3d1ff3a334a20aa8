//! Opaque volume handles.
//!
//! The association core never touches pixel or mask bytes directly. Image
//! series and segmentation payloads are exposed through the two capability
//! traits below, so the parsers behind them can change without the linker or
//! the engine noticing.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// `[slices, rows, columns]`
pub type Shape = [usize; 3];

/// Header attributes stored next to a payload.
pub type Attributes = Map<String, Value>;

pub fn voxel_count(shape: Shape) -> usize {
    shape.iter().product()
}

/// Spatial layout of an assembled series, used to align masks onto it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesGeometry {
    pub rows: usize,
    pub columns: usize,
    pub slices: usize,
    /// Slice normal derived from ImageOrientationPatient, if known.
    pub normal: Option<[f64; 3]>,
    /// Position of each slice along `normal`, in slice order. Empty when any
    /// slice lacked a position.
    pub positions: Vec<f64>,
}

impl SeriesGeometry {
    pub fn shape(&self) -> Shape {
        [self.slices, self.rows, self.columns]
    }

    /// Projects a patient-space position on the slice normal.
    pub fn project(&self, position: [f64; 3]) -> Option<f64> {
        self.normal.map(|n| dot(n, position))
    }

    /// Index of the slice closest to `offset`, rejecting anything further
    /// than half a slice spacing away.
    pub fn nearest_slice(&self, offset: f64) -> Option<usize> {
        if self.positions.is_empty() {
            return None;
        }
        let (index, distance) = self
            .positions
            .iter()
            .enumerate()
            .map(|(i, p)| (i, (p - offset).abs()))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        let tolerance = self
            .positions
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .filter(|d| *d > f64::EPSILON)
            .min_by(f64::total_cmp)
            .map(|spacing| spacing / 2.0)
            .unwrap_or(1e-3);
        (distance <= tolerance).then_some(index)
    }
}

pub fn slice_normal(orientation: &[f64; 6]) -> [f64; 3] {
    let row = [orientation[0], orientation[1], orientation[2]];
    let col = [orientation[3], orientation[4], orientation[5]];
    [
        row[1] * col[2] - row[2] * col[1],
        row[2] * col[0] - row[0] * col[2],
        row[0] * col[1] - row[1] * col[0],
    ]
}

pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Image payload of one series, rescaled to `f32`.
pub trait ImageVolume {
    fn shape(&self) -> Shape;

    fn attributes(&self) -> &Attributes;

    /// Fills `out` (length `voxel_count(shape)`) in slice, row, column order.
    fn read_into(&self, out: &mut [f32]) -> Result<()>;

    fn read_array(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0; voxel_count(self.shape())];
        self.read_into(&mut out)?;
        Ok(out)
    }
}

/// Binary mask payload of one segmentation.
///
/// Masks may be stored sparser than the image they annotate, so reading
/// always happens against the geometry of the linked series.
pub trait MaskVolume: fmt::Debug + Send + Sync {
    /// Shape of the mask as stored, when it is known without decoding.
    fn shape(&self) -> Option<Shape>;

    fn attributes(&self) -> &Attributes;

    /// Writes the mask, aligned to `geometry`, into `out` as 0/1 values.
    fn read_into(&self, geometry: &SeriesGeometry, out: &mut [u8]) -> Result<()>;

    fn read_aligned(&self, geometry: &SeriesGeometry) -> Result<Vec<u8>> {
        let mut out = vec![0; voxel_count(geometry.shape())];
        self.read_into(geometry, &mut out)?;
        Ok(out)
    }
}

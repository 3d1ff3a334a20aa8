//! NPY payloads of the archive, through `ndarray-npy`.
//!
//! Arrays are stored C-ordered as `[slices, rows, columns]`: `float32` for
//! images and `uint8` for masks.

use std::io::{Read, Write};

use ndarray::{Array3, ArrayView3};
use ndarray_npy::{ReadNpyExt, ReadableElement, WritableElement, WriteNpyExt};

use crate::error::Result;
use crate::volume::Shape;

pub fn write<T, W>(writer: W, shape: Shape, values: &[T]) -> Result<()>
where
    T: WritableElement,
    W: Write,
{
    ArrayView3::from_shape(shape, values)?.write_npy(writer)?;
    Ok(())
}

/// Reads a three-dimensional array, returning its shape and values in
/// C order whatever order the file was stored in.
pub fn read<T, R>(reader: R) -> Result<(Shape, Vec<T>)>
where
    T: ReadableElement + Clone,
    R: Read,
{
    let array = Array3::<T>::read_npy(reader)?;
    let (slices, rows, columns) = array.dim();
    Ok(([slices, rows, columns], array.iter().cloned().collect()))
}

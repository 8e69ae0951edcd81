//! NIfTI reading and writing.

use super::VolumeError;
use ndarray::{Array3, ArrayD, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// Reads a 3-D volume as `f64`, together with its header.
///
/// Trailing singleton dimensions are dropped.
pub fn read_volume(path: &Path) -> Result<(Array3<f64>, NiftiHeader), VolumeError> {
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f64>()?;
    Ok((squeeze_to_3d(data)?, header))
}

/// Reads a mask volume; every non-zero finite voxel becomes 1.
pub fn read_mask(path: &Path) -> Result<(Array3<u8>, NiftiHeader), VolumeError> {
    let (data, header) = read_volume(path)?;
    Ok((data.mapv(|v| u8::from(v.is_finite() && v != 0.0)), header))
}

/// Writes a volume using `reference` for geometry.
pub fn write_volume(path: &Path, data: &Array3<f64>, reference: &NiftiHeader) -> Result<(), VolumeError> {
    WriterOptions::new(path)
        .reference_header(reference)
        .write_nifti(data)?;
    Ok(())
}

/// Writes a mask using `reference` for geometry.
pub fn write_mask(path: &Path, mask: &Array3<u8>, reference: &NiftiHeader) -> Result<(), VolumeError> {
    WriterOptions::new(path)
        .reference_header(reference)
        .write_nifti(mask)?;
    Ok(())
}

fn squeeze_to_3d(mut data: ArrayD<f64>) -> Result<Array3<f64>, VolumeError> {
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let ndim = data.ndim();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| VolumeError::NotThreeD(ndim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_squeeze_trailing_singleton() {
        let data = ArrayD::<f64>::zeros(IxDyn(&[4, 5, 6, 1]));
        let squeezed = squeeze_to_3d(data).unwrap();
        assert_eq!(squeezed.shape(), &[4, 5, 6]);
    }

    #[test]
    fn test_squeeze_rejects_4d() {
        let data = ArrayD::<f64>::zeros(IxDyn(&[4, 5, 6, 2]));
        assert!(matches!(squeeze_to_3d(data), Err(VolumeError::NotThreeD(4))));
    }

    #[test]
    fn test_write_then_read_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");
        let data = Array3::from_shape_fn((4, 3, 2), |(i, j, k)| (i * 6 + j * 2 + k) as f64);

        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        write_volume(&path, &data, &header).unwrap();

        let (restored, _) = read_volume(&path).unwrap();
        assert_eq!(restored.shape(), data.shape());
        assert!((restored[[3, 2, 1]] - data[[3, 2, 1]]).abs() < 1e-9);
    }
}

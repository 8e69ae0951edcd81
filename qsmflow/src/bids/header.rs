//! Volume header geometry and the reader seam.

use crate::errors::QsmflowError;
use nifti::NiftiHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// Geometry of one volume file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeHeader {
    /// Dimension sizes.
    pub dims: Vec<usize>,
    /// Voxel size in millimetres.
    pub voxel_size: [f64; 3],
    /// Voxel-to-world transform.
    pub affine: [[f64; 4]; 4],
}

impl VolumeHeader {
    /// An axis-aligned 3-D header.
    #[must_use]
    pub fn axial(dims: [usize; 3], voxel_size: [f64; 3]) -> Self {
        let mut affine = [[0.0; 4]; 4];
        for (axis, size) in voxel_size.iter().enumerate() {
            affine[axis][axis] = *size;
        }
        affine[3][3] = 1.0;
        Self {
            dims: dims.to_vec(),
            voxel_size,
            affine,
        }
    }

    /// Replaces the affine.
    #[must_use]
    pub fn with_affine(mut self, affine: [[f64; 4]; 4]) -> Self {
        self.affine = affine;
        self
    }

    /// Extracts geometry from a NIfTI header. The sform is used when set,
    /// otherwise a diagonal affine from the pixel dimensions.
    #[must_use]
    pub fn from_nifti(header: &NiftiHeader) -> Self {
        let ndim = usize::from(header.dim[0]).clamp(1, 7);
        let dims = header.dim[1..=ndim].iter().map(|d| usize::from(*d)).collect();
        let voxel_size = [
            f64::from(header.pixdim[1]),
            f64::from(header.pixdim[2]),
            f64::from(header.pixdim[3]),
        ];

        let affine = if header.sform_code > 0 {
            let row = |r: [f32; 4]| r.map(f64::from);
            [
                row(header.srow_x),
                row(header.srow_y),
                row(header.srow_z),
                [0.0, 0.0, 0.0, 1.0],
            ]
        } else {
            Self::axial([0, 0, 0], voxel_size).affine
        };

        Self {
            dims,
            voxel_size,
            affine,
        }
    }

    /// True when no dimension beyond the third exceeds 1.
    #[must_use]
    pub fn is_3d(&self) -> bool {
        self.dims.iter().skip(3).all(|d| *d == 1)
    }

    /// Spatial dimensions.
    #[must_use]
    pub fn spatial_dims(&self) -> [usize; 3] {
        let dim = |i: usize| self.dims.get(i).copied().unwrap_or(1);
        [dim(0), dim(1), dim(2)]
    }

    /// Voxels in the spatial grid.
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.spatial_dims().iter().product()
    }

    /// Largest angle, in degrees, between a voxel axis and the nearest
    /// world axis.
    #[must_use]
    pub fn obliquity(&self) -> f64 {
        (0..3)
            .map(|col| {
                let column = [self.affine[0][col], self.affine[1][col], self.affine[2][col]];
                let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
                if norm == 0.0 {
                    return 0.0;
                }
                let dominant = column.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
                (dominant / norm).clamp(-1.0, 1.0).acos().to_degrees()
            })
            .fold(0.0, f64::max)
    }

    /// True when both headers share spatial dimensions and affine.
    #[must_use]
    pub fn same_geometry(&self, other: &Self) -> bool {
        self.spatial_dims() == other.spatial_dims()
            && self
                .affine
                .iter()
                .flatten()
                .zip(other.affine.iter().flatten())
                .all(|(a, b)| (a - b).abs() <= GEOMETRY_TOLERANCE)
    }
}

/// Reads volume headers.
pub trait HeaderReader: Send + Sync + std::fmt::Debug {
    /// Reads the header of a volume file.
    fn read_header(&self, path: &Path) -> Result<VolumeHeader, QsmflowError>;
}

/// Reads NIfTI-1 headers from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiHeaderReader;

impl HeaderReader for NiftiHeaderReader {
    fn read_header(&self, path: &Path) -> Result<VolumeHeader, QsmflowError> {
        let header = NiftiHeader::from_file(path)
            .map_err(|e| QsmflowError::BadBids(format!("cannot read header of {}: {e}", path.display())))?;
        Ok(VolumeHeader::from_nifti(&header))
    }
}

/// Serves headers from memory; unknown paths get the default header.
#[derive(Debug, Clone)]
pub struct InMemoryHeaderReader {
    default: VolumeHeader,
    overrides: HashMap<PathBuf, VolumeHeader>,
}

impl InMemoryHeaderReader {
    /// Creates a reader returning `default` for every path.
    #[must_use]
    pub fn new(default: VolumeHeader) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Sets the header of one path.
    #[must_use]
    pub fn with_override(mut self, path: impl Into<PathBuf>, header: VolumeHeader) -> Self {
        self.overrides.insert(path.into(), header);
        self
    }
}

impl HeaderReader for InMemoryHeaderReader {
    fn read_header(&self, path: &Path) -> Result<VolumeHeader, QsmflowError> {
        Ok(self.overrides.get(path).unwrap_or(&self.default).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axial_has_no_obliquity() {
        let h = VolumeHeader::axial([64, 64, 32], [1.0, 1.0, 2.0]);
        assert!(h.obliquity().abs() < 1e-9);
        assert_eq!(h.voxel_count(), 64 * 64 * 32);
        assert!(h.is_3d());
    }

    #[test]
    fn test_rotated_obliquity() {
        let angle = 20.0_f64.to_radians();
        let (s, c) = angle.sin_cos();
        let affine = [
            [c, -s, 0.0, 0.0],
            [s, c, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let h = VolumeHeader::axial([8, 8, 8], [1.0; 3]).with_affine(affine);
        assert!((h.obliquity() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_four_dimensional_detected() {
        let mut h = VolumeHeader::axial([8, 8, 8], [1.0; 3]);
        h.dims.push(1);
        assert!(h.is_3d());
        h.dims[3] = 4;
        assert!(!h.is_3d());
    }

    #[test]
    fn test_nifti_header_conversion() {
        let mut header = NiftiHeader::default();
        header.dim = [3, 10, 12, 14, 1, 1, 1, 1];
        header.pixdim = [1.0, 0.5, 0.5, 2.0, 1.0, 1.0, 1.0, 1.0];
        header.sform_code = 0;
        let h = VolumeHeader::from_nifti(&header);
        assert_eq!(h.dims, vec![10, 12, 14]);
        assert_eq!(h.voxel_size, [0.5, 0.5, 2.0]);
        assert_eq!(h.affine[2][2], 2.0);
    }

    #[test]
    fn test_in_memory_override() {
        let reader = InMemoryHeaderReader::new(VolumeHeader::axial([4, 4, 4], [1.0; 3]))
            .with_override("/x/odd.nii", VolumeHeader::axial([5, 4, 4], [1.0; 3]));
        let odd = reader.read_header(Path::new("/x/odd.nii")).unwrap();
        let even = reader.read_header(Path::new("/x/other.nii")).unwrap();
        assert!(!odd.same_geometry(&even));
    }
}

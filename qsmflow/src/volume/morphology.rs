//! Binary morphology and Gaussian smoothing for masks.

use ndarray::{Array3, Axis};
use std::collections::VecDeque;

const NEIGHBOURS_6: [(isize, isize, isize); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// Voxels set in a full 3×3×3 neighbourhood count before a hole is closed.
const SMALL_HOLE_COUNT: usize = 25;

fn offset(idx: (usize, usize, usize), d: (isize, isize, isize), dim: (usize, usize, usize)) -> Option<(usize, usize, usize)> {
    let i = idx.0.checked_add_signed(d.0)?;
    let j = idx.1.checked_add_signed(d.1)?;
    let k = idx.2.checked_add_signed(d.2)?;
    (i < dim.0 && j < dim.1 && k < dim.2).then_some((i, j, k))
}

/// Fills every background region not connected to the volume border.
#[must_use]
pub fn fill_holes(mask: &Array3<u8>) -> Array3<u8> {
    let dim = mask.dim();
    let mut exterior = Array3::<bool>::from_elem(dim, false);
    let mut queue = VecDeque::new();

    for ((i, j, k), &v) in mask.indexed_iter() {
        let on_border = i == 0 || j == 0 || k == 0 || i + 1 == dim.0 || j + 1 == dim.1 || k + 1 == dim.2;
        if on_border && v == 0 {
            exterior[[i, j, k]] = true;
            queue.push_back((i, j, k));
        }
    }

    while let Some(idx) = queue.pop_front() {
        for d in NEIGHBOURS_6 {
            if let Some(n) = offset(idx, d, dim) {
                if mask[n] == 0 && !exterior[n] {
                    exterior[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }

    exterior.mapv(|outside| u8::from(!outside))
}

/// Closes background voxels surrounded by at least 25 set neighbours in
/// their 3×3×3 window.
#[must_use]
pub fn fill_small_holes(mask: &Array3<u8>) -> Array3<u8> {
    let dim = mask.dim();
    let mut out = mask.clone();
    for ((i, j, k), &v) in mask.indexed_iter() {
        if v != 0 {
            continue;
        }
        let mut count = 0;
        for di in -1..=1 {
            for dj in -1..=1 {
                for dk in -1..=1 {
                    if let Some(n) = offset((i, j, k), (di, dj, dk), dim) {
                        count += usize::from(mask[n] != 0);
                    }
                }
            }
        }
        if count >= SMALL_HOLE_COUNT {
            out[[i, j, k]] = 1;
        }
    }
    out
}

fn step(mask: &Array3<u8>, grow: bool) -> Array3<u8> {
    let dim = mask.dim();
    Array3::from_shape_fn(dim, |idx| {
        let current = mask[idx] != 0;
        let neighbours = NEIGHBOURS_6
            .iter()
            .map(|d| offset(idx, *d, dim).map_or(false, |n| mask[n] != 0));
        let set = if grow {
            current || neighbours.into_iter().any(|v| v)
        } else {
            current && neighbours.into_iter().all(|v| v)
        };
        u8::from(set)
    })
}

/// Binary erosion with a 6-connected element; the border counts as background.
#[must_use]
pub fn erode(mask: &Array3<u8>, iterations: usize) -> Array3<u8> {
    (0..iterations).fold(mask.clone(), |m, _| step(&m, false))
}

/// Binary dilation with a 6-connected element.
#[must_use]
pub fn dilate(mask: &Array3<u8>, iterations: usize) -> Array3<u8> {
    (0..iterations).fold(mask.clone(), |m, _| step(&m, true))
}

fn kernel_1d(sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x as f64).powi(2) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Separable Gaussian smoothing with per-axis sigma in voxels.
///
/// Kernels are truncated at 3σ and normalised; samples beyond the volume
/// are treated as zero.
#[must_use]
pub fn gaussian_smooth(data: &Array3<f64>, sigma_vox: [f64; 3]) -> Array3<f64> {
    let mut current = data.clone();
    for (axis, sigma) in sigma_vox.iter().enumerate() {
        let kernel = kernel_1d(*sigma);
        if kernel.len() == 1 {
            continue;
        }
        let radius = (kernel.len() / 2) as isize;
        let mut next = Array3::<f64>::zeros(current.dim());
        for (src, mut dst) in current
            .lanes(Axis(axis))
            .into_iter()
            .zip(next.lanes_mut(Axis(axis)))
        {
            let n = src.len() as isize;
            for x in 0..n {
                let mut acc = 0.0;
                for (t, w) in kernel.iter().enumerate() {
                    let pos = x + t as isize - radius;
                    if (0..n).contains(&pos) {
                        acc += w * src[pos as usize];
                    }
                }
                dst[x as usize] = acc;
            }
        }
        current = next;
    }
    current
}

/// Gaussian hole filling settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFill {
    /// Smoothing width in millimetres.
    pub sigma_mm: f64,
    /// Level the smoothed mask is rethresholded at.
    pub level: f64,
}

impl GaussianFill {
    /// Wide kernels (≥ 4 mm) rethreshold lower so thin structures survive.
    #[must_use]
    pub fn new(sigma_mm: f64) -> Self {
        let level = if sigma_mm >= 4.0 { 0.3 } else { 0.5 };
        Self { sigma_mm, level }
    }
}

impl Default for GaussianFill {
    fn default() -> Self {
        Self::new(5.0)
    }
}

/// Smooths a mask, rethresholds it, then closes small holes.
#[must_use]
pub fn gaussian_fill(mask: &Array3<u8>, voxel_size: [f64; 3], fill: GaussianFill) -> Array3<u8> {
    let sigma_vox = voxel_size.map(|vsz| if vsz > 0.0 { fill.sigma_mm / vsz } else { 0.0 });
    let smoothed = gaussian_smooth(&mask.mapv(f64::from), sigma_vox);
    let rethresholded = smoothed.mapv(|v| u8::from(v > fill.level));
    fill_small_holes(&rethresholded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hollow_cube() -> Array3<u8> {
        // 7^3 shell inside a 9^3 volume, cavity 5^3
        Array3::from_shape_fn((9, 9, 9), |(i, j, k)| {
            let inside = |x: usize| (1..=7).contains(&x);
            let cavity = |x: usize| (2..=6).contains(&x);
            u8::from(inside(i) && inside(j) && inside(k) && !(cavity(i) && cavity(j) && cavity(k)))
        })
    }

    fn count(mask: &Array3<u8>) -> usize {
        mask.iter().filter(|v| **v != 0).count()
    }

    #[test]
    fn test_fill_holes_closes_cavity() {
        let filled = fill_holes(&hollow_cube());
        assert_eq!(count(&filled), 7 * 7 * 7);
        assert_eq!(filled[[4, 4, 4]], 1);
        assert_eq!(filled[[0, 0, 0]], 0);
    }

    #[test]
    fn test_fill_holes_keeps_open_background() {
        let mut mask = hollow_cube();
        // punch a tunnel from the cavity to the outside
        mask[[4, 4, 1]] = 0;
        mask[[4, 4, 0]] = 0;
        let filled = fill_holes(&mask);
        assert_eq!(filled[[4, 4, 4]], 0);
    }

    #[test]
    fn test_erode_then_dilate() {
        let mut cube = Array3::<u8>::zeros((9, 9, 9));
        cube.slice_mut(ndarray::s![2..7, 2..7, 2..7]).fill(1);

        let eroded = erode(&cube, 1);
        assert_eq!(count(&eroded), 3 * 3 * 3);

        let grown = dilate(&eroded, 1);
        // a 3^3 cube dilated by the 6-neighbourhood adds one face layer each side
        assert_eq!(count(&grown), 27 + 6 * 9);

        assert_eq!(erode(&cube, 0), cube);
    }

    #[test]
    fn test_erode_treats_border_as_background() {
        let full = Array3::<u8>::ones((3, 3, 3));
        let eroded = erode(&full, 1);
        assert_eq!(count(&eroded), 1);
    }

    #[test]
    fn test_smoothing_preserves_interior_mass() {
        let mut data = Array3::<f64>::zeros((15, 15, 15));
        data[[7, 7, 7]] = 1.0;
        let smoothed = gaussian_smooth(&data, [1.0, 1.0, 1.0]);
        let total: f64 = smoothed.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(smoothed[[7, 7, 7]] > smoothed[[7, 7, 8]]);
    }

    #[test]
    fn test_fill_level_follows_sigma() {
        assert_eq!(GaussianFill::new(5.0).level, 0.3);
        assert_eq!(GaussianFill::new(2.0).level, 0.5);
        assert_eq!(GaussianFill::default(), GaussianFill::new(5.0));
    }

    #[test]
    fn test_gaussian_fill_closes_pinhole() {
        let mut cube = Array3::<u8>::zeros((9, 9, 9));
        cube.slice_mut(ndarray::s![1..8, 1..8, 1..8]).fill(1);
        cube[[4, 4, 4]] = 0;
        let filled = gaussian_fill(&cube, [1.0, 1.0, 1.0], GaussianFill::new(1.0));
        assert_eq!(filled[[4, 4, 4]], 1);
        assert_eq!(filled[[0, 0, 0]], 0);
    }

    #[test]
    fn test_small_hole_filled() {
        let mut cube = Array3::<u8>::ones((5, 5, 5));
        cube[[2, 2, 2]] = 0;
        assert_eq!(fill_small_holes(&cube)[[2, 2, 2]], 1);

        let mut sparse = Array3::<u8>::zeros((5, 5, 5));
        sparse[[2, 2, 1]] = 1;
        assert_eq!(fill_small_holes(&sparse)[[2, 2, 2]], 0);
    }
}

//! Resource estimation per stage family.

use super::ResourceHints;

const BYTES_PER_VOXEL: f64 = 8.0;
const GB: f64 = 1e9;

/// Estimates resource hints from the reconstruction unit's size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceEstimator {
    voxels: usize,
    echoes: usize,
}

impl ResourceEstimator {
    /// Creates an estimator for `voxels` per volume and `echoes` echoes.
    #[must_use]
    pub fn new(voxels: usize, echoes: usize) -> Self {
        Self {
            voxels,
            echoes: echoes.max(1),
        }
    }

    fn volume_gb(&self, copies: f64) -> f64 {
        self.voxels as f64 * BYTES_PER_VOXEL * copies / GB
    }

    /// Light voxel-wise operations.
    #[must_use]
    pub fn light(&self) -> ResourceHints {
        ResourceHints::default().with_mem_gb(self.volume_gb(4.0).max(0.5))
    }

    /// Operations holding every echo in memory (averages, merges).
    #[must_use]
    pub fn multi_echo(&self) -> ResourceHints {
        ResourceHints::default().with_mem_gb(self.volume_gb(4.0 * self.echoes as f64).max(0.5))
    }

    /// Brain extraction: ten volume copies.
    #[must_use]
    pub fn bet(&self) -> ResourceHints {
        ResourceHints::default().with_mem_gb(self.volume_gb(10.0))
    }

    /// ROMEO unwrapping or combination.
    #[must_use]
    pub fn romeo(&self) -> ResourceHints {
        ResourceHints::default()
            .with_mem_gb(self.volume_gb(20.0 * self.echoes as f64).max(8.0))
            .with_walltime_hours(2.0)
    }

    /// VSHARP background removal.
    #[must_use]
    pub fn vsharp(&self) -> ResourceHints {
        ResourceHints::default().with_mem_gb(self.volume_gb(30.0).max(3.0))
    }

    /// PDF background removal.
    #[must_use]
    pub fn pdf(&self) -> ResourceHints {
        ResourceHints::default()
            .with_mem_gb(self.volume_gb(30.0).max(3.0))
            .with_walltime_hours(2.0)
    }

    /// Closed-form and TV k-space inversions.
    #[must_use]
    pub fn kspace_inversion(&self) -> ResourceHints {
        ResourceHints::default()
            .with_mem_gb(self.volume_gb(40.0).max(4.0))
            .with_walltime_hours(2.0)
    }

    /// TGV joint solve.
    #[must_use]
    pub fn tgv(&self) -> ResourceHints {
        ResourceHints::default()
            .with_mem_gb(self.volume_gb(40.0).max(6.0))
            .with_n_procs(2)
            .with_walltime_hours(6.0)
    }

    /// NeXtQSM network inference.
    #[must_use]
    pub fn nextqsm(&self) -> ResourceHints {
        ResourceHints::default()
            .with_mem_gb(self.volume_gb(60.0).max(13.0))
            .with_n_procs(2)
            .with_walltime_hours(3.0)
    }

    /// External supplementary tools (SWI, relaxometry, segmentation).
    #[must_use]
    pub fn supplementary(&self) -> ResourceHints {
        ResourceHints::default()
            .with_mem_gb(self.volume_gb(10.0 * self.echoes as f64).max(2.0))
            .with_walltime_hours(4.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_floors() {
        let small = ResourceEstimator::new(64 * 64 * 32, 2);
        assert!(small.nextqsm().mem_gb >= 13.0);
        assert!((small.romeo().mem_gb - 8.0).abs() < 1e-9);
        assert!((small.vsharp().mem_gb - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_bet_scales_with_voxels() {
        let voxels = 256 * 256 * 176;
        let hints = ResourceEstimator::new(voxels, 1).bet();
        let expected = 10.0 * voxels as f64 * 8.0 / 1e9;
        assert!((hints.mem_gb - expected).abs() < 1e-12);
    }

    #[test]
    fn test_romeo_grows_with_echoes() {
        let voxels = 512 * 512 * 200;
        let one = ResourceEstimator::new(voxels, 1).romeo().mem_gb;
        let four = ResourceEstimator::new(voxels, 4).romeo().mem_gb;
        assert!(four > one);
    }
}

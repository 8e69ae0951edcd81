//! Derivative output layout relative to the output root.

/// Output paths of one reconstruction unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    id: String,
}

impl OutputLayout {
    /// Layout for a unit identifier (`sub-1_ses-2_run-1`).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn path(&self, dir: &str, suffix: &str) -> String {
        format!("{dir}/{}_{suffix}", self.id)
    }

    /// Final susceptibility map.
    #[must_use]
    pub fn qsm(&self) -> String {
        self.path("qsm", "Chimap.nii.gz")
    }

    /// Single-pass map of a two-pass run.
    #[must_use]
    pub fn qsm_singlepass(&self) -> String {
        self.path("qsm/singlepass", "Chimap.nii.gz")
    }

    /// Primary mask.
    #[must_use]
    pub fn mask(&self) -> String {
        self.path("mask", "mask.nii.gz")
    }

    /// SWI.
    #[must_use]
    pub fn swi(&self) -> String {
        self.path("swi", "swi.nii.gz")
    }

    /// SWI minimum-intensity projection.
    #[must_use]
    pub fn swi_mip(&self) -> String {
        self.path("swi", "swi-mip.nii.gz")
    }

    /// T2* map.
    #[must_use]
    pub fn t2starmap(&self) -> String {
        self.path("t2s", "T2starmap.nii.gz")
    }

    /// R2* map.
    #[must_use]
    pub fn r2starmap(&self) -> String {
        self.path("r2s", "R2starmap.nii.gz")
    }

    /// Segmentation in QSM space.
    #[must_use]
    pub fn segmentation_qsm(&self) -> String {
        self.path("segmentations/qsm", "dseg.nii.gz")
    }

    /// Segmentation in T1w space.
    #[must_use]
    pub fn segmentation_t1w(&self) -> String {
        self.path("segmentations/t1w", "dseg.nii.gz")
    }

    /// T1w-to-QSM transform.
    #[must_use]
    pub fn transform(&self) -> String {
        self.path("segmentations/transforms", "from-T1w_to-qsm.mat")
    }

    /// Region statistics.
    #[must_use]
    pub fn analysis(&self) -> String {
        self.path("analysis", "analysis.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let layout = OutputLayout::new("sub-1_ses-2");
        assert_eq!(layout.qsm(), "qsm/sub-1_ses-2_Chimap.nii.gz");
        assert_eq!(layout.qsm_singlepass(), "qsm/singlepass/sub-1_ses-2_Chimap.nii.gz");
        assert_eq!(layout.transform(), "segmentations/transforms/sub-1_ses-2_from-T1w_to-qsm.mat");
        assert_eq!(layout.analysis(), "analysis/sub-1_ses-2_analysis.csv");
    }
}

//! On-disk BIDS fixtures.

use std::path::{Path, PathBuf};

/// Writes a minimal BIDS session: empty NIfTI placeholders plus sidecars.
///
/// Volume contents are never read by discovery when an in-memory header
/// reader is used, so the placeholders stay empty.
#[derive(Debug, Clone)]
pub struct BidsFixture {
    root: PathBuf,
    subject: String,
    session: Option<String>,
    acq: Option<String>,
    run: Option<String>,
    suffix: String,
    echo_times: Vec<f64>,
    field_strength: f64,
    magnitude: bool,
    mask_pipeline: Option<String>,
    segmentation_pipeline: Option<String>,
    t1w: bool,
}

impl BidsFixture {
    /// Starts a fixture rooted at `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            subject: "1".to_string(),
            session: None,
            acq: None,
            run: None,
            suffix: "MEGRE".to_string(),
            echo_times: vec![0.012],
            field_strength: 3.0,
            magnitude: false,
            mask_pipeline: None,
            segmentation_pipeline: None,
            t1w: false,
        }
    }

    /// Sets the subject label.
    #[must_use]
    pub fn subject(mut self, label: &str) -> Self {
        self.subject = label.to_string();
        self
    }

    /// Sets the session label.
    #[must_use]
    pub fn session(mut self, label: &str) -> Self {
        self.session = Some(label.to_string());
        self
    }

    /// Sets the acquisition label.
    #[must_use]
    pub fn acq(mut self, label: &str) -> Self {
        self.acq = Some(label.to_string());
        self
    }

    /// Sets the run label.
    #[must_use]
    pub fn run(mut self, label: &str) -> Self {
        self.run = Some(label.to_string());
        self
    }

    /// Sets the echo times; one phase file per echo.
    #[must_use]
    pub fn echoes(mut self, echo_times: &[f64]) -> Self {
        self.echo_times = echo_times.to_vec();
        self
    }

    /// Sets the field strength written to sidecars.
    #[must_use]
    pub fn field_strength(mut self, tesla: f64) -> Self {
        self.field_strength = tesla;
        self
    }

    /// Writes a magnitude file per echo.
    #[must_use]
    pub fn with_magnitude(mut self) -> Self {
        self.magnitude = true;
        self
    }

    /// Writes one brain mask into `derivatives/<pipeline>`.
    #[must_use]
    pub fn with_existing_mask(mut self, pipeline: &str) -> Self {
        self.mask_pipeline = Some(pipeline.to_string());
        self
    }

    /// Writes one segmentation in the QSM space into `derivatives/<pipeline>`.
    #[must_use]
    pub fn with_existing_segmentation(mut self, pipeline: &str) -> Self {
        self.segmentation_pipeline = Some(pipeline.to_string());
        self
    }

    /// Writes a T1-weighted image.
    #[must_use]
    pub fn with_t1w(mut self) -> Self {
        self.t1w = true;
        self
    }

    fn session_path(&self) -> PathBuf {
        let mut path = PathBuf::from(format!("sub-{}", self.subject));
        if let Some(ses) = &self.session {
            path.push(format!("ses-{ses}"));
        }
        path.push("anat");
        path
    }

    fn prefix(&self) -> String {
        let mut name = format!("sub-{}", self.subject);
        for (key, value) in [("ses", &self.session), ("acq", &self.acq), ("run", &self.run)] {
            if let Some(v) = value {
                name.push_str(&format!("_{key}-{v}"));
            }
        }
        name
    }

    /// Writes the files and returns the phase paths in echo order.
    pub fn write(&self) -> std::io::Result<Vec<PathBuf>> {
        let anat = self.root.join(self.session_path());
        std::fs::create_dir_all(&anat)?;

        let prefix = self.prefix();
        let multi_echo = self.echo_times.len() > 1;
        let mut phase_paths = Vec::new();

        for (i, te) in self.echo_times.iter().enumerate() {
            let echo = if multi_echo {
                format!("_echo-{}", i + 1)
            } else {
                String::new()
            };
            let phase = anat.join(format!("{prefix}{echo}_part-phase_{}.nii", self.suffix));
            std::fs::write(&phase, b"")?;
            std::fs::write(
                phase.with_extension("json"),
                serde_json::json!({
                    "EchoTime": te,
                    "MagneticFieldStrength": self.field_strength,
                })
                .to_string(),
            )?;
            if self.magnitude {
                std::fs::write(anat.join(format!("{prefix}{echo}_part-mag_{}.nii", self.suffix)), b"")?;
            }
            phase_paths.push(phase);
        }

        if let Some(pipeline) = &self.mask_pipeline {
            let dir = self.root.join("derivatives").join(pipeline).join(self.session_path());
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(format!("{prefix}_space-orig_label-brain_mask.nii")), b"")?;
        }

        if let Some(pipeline) = &self.segmentation_pipeline {
            let dir = self.root.join("derivatives").join(pipeline).join(self.session_path());
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(format!("{prefix}_space-qsm_dseg.nii")), b"")?;
        }

        if self.t1w {
            let mut name = format!("sub-{}", self.subject);
            if let Some(ses) = &self.session {
                name.push_str(&format!("_ses-{ses}"));
            }
            std::fs::write(anat.join(format!("{name}_T1w.nii")), b"")?;
        }

        Ok(phase_paths)
    }
}

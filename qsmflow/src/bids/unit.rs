//! Reconstruction units.

use super::VolumeHeader;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One (subject, session, acquisition, run) and its files.
///
/// Echo-indexed vectors (`phase`, `sidecars`, `echo_times`,
/// `phase_headers`) have equal length. `magnitude` and `masks` may be
/// empty, hold one entry, or one per echo; the resolver decides what a
/// deviating count disables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionUnit {
    /// Subject label.
    pub subject: String,
    /// Session label.
    pub session: Option<String>,
    /// Acquisition label.
    pub acq: Option<String>,
    /// Reconstruction label.
    pub rec: Option<String>,
    /// Inversion label.
    pub inv: Option<String>,
    /// Run label.
    pub run: Option<String>,
    /// BIDS suffix of the phase files.
    pub suffix: String,
    /// Phase files in echo order.
    pub phase: Vec<PathBuf>,
    /// Magnitude files in echo order.
    pub magnitude: Vec<PathBuf>,
    /// Existing masks.
    pub masks: Vec<PathBuf>,
    /// Phase sidecars in echo order.
    pub sidecars: Vec<PathBuf>,
    /// Echo times in seconds.
    pub echo_times: Vec<f64>,
    /// Field strength in tesla.
    pub field_strength: f64,
    /// Phase headers in echo order.
    pub phase_headers: Vec<VolumeHeader>,
    /// Magnitude headers.
    pub magnitude_headers: Vec<VolumeHeader>,
    /// Existing mask headers.
    pub mask_headers: Vec<VolumeHeader>,
    /// T1-weighted image of the session.
    pub t1w: Option<PathBuf>,
    /// Existing segmentation in the QSM space.
    pub segmentation: Option<PathBuf>,
}

impl ReconstructionUnit {
    /// Creates an empty unit for a subject.
    #[must_use]
    pub fn new(subject: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session: None,
            acq: None,
            rec: None,
            inv: None,
            run: None,
            suffix: suffix.into(),
            phase: Vec::new(),
            magnitude: Vec::new(),
            masks: Vec::new(),
            sidecars: Vec::new(),
            echo_times: Vec::new(),
            field_strength: 0.0,
            phase_headers: Vec::new(),
            magnitude_headers: Vec::new(),
            mask_headers: Vec::new(),
            t1w: None,
            segmentation: None,
        }
    }

    /// Sets the session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Sets the acquisition.
    #[must_use]
    pub fn with_acq(mut self, acq: impl Into<String>) -> Self {
        self.acq = Some(acq.into());
        self
    }

    /// Sets the run.
    #[must_use]
    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    /// Sets the field strength.
    #[must_use]
    pub fn with_field_strength(mut self, tesla: f64) -> Self {
        self.field_strength = tesla;
        self
    }

    /// Appends one phase echo with its echo time and header.
    #[must_use]
    pub fn with_echo(mut self, phase: impl Into<PathBuf>, echo_time: f64, header: VolumeHeader) -> Self {
        let phase = phase.into();
        self.sidecars.push(super::sidecar_path(&phase));
        self.phase.push(phase);
        self.echo_times.push(echo_time);
        self.phase_headers.push(header);
        self
    }

    /// Appends a magnitude file.
    #[must_use]
    pub fn with_magnitude(mut self, path: impl Into<PathBuf>, header: VolumeHeader) -> Self {
        self.magnitude.push(path.into());
        self.magnitude_headers.push(header);
        self
    }

    /// Appends an existing mask.
    #[must_use]
    pub fn with_mask(mut self, path: impl Into<PathBuf>, header: VolumeHeader) -> Self {
        self.masks.push(path.into());
        self.mask_headers.push(header);
        self
    }

    /// Sets the T1-weighted image.
    #[must_use]
    pub fn with_t1w(mut self, path: impl Into<PathBuf>) -> Self {
        self.t1w = Some(path.into());
        self
    }

    /// Sets an existing segmentation.
    #[must_use]
    pub fn with_segmentation(mut self, path: impl Into<PathBuf>) -> Self {
        self.segmentation = Some(path.into());
        self
    }

    /// Stable identifier `sub-S[_ses-T][_acq-A][_rec-R][_inv-I][_run-N]`.
    #[must_use]
    pub fn id(&self) -> String {
        let mut id = format!("sub-{}", self.subject);
        for (key, value) in [
            ("ses", &self.session),
            ("acq", &self.acq),
            ("rec", &self.rec),
            ("inv", &self.inv),
            ("run", &self.run),
        ] {
            if let Some(v) = value {
                id.push_str(&format!("_{key}-{v}"));
            }
        }
        id
    }

    /// Number of echoes.
    #[must_use]
    pub fn echo_count(&self) -> usize {
        self.phase.len()
    }

    /// True when any magnitude is present.
    #[must_use]
    pub fn has_magnitude(&self) -> bool {
        !self.magnitude.is_empty()
    }

    /// Header of the first phase echo.
    #[must_use]
    pub fn reference_header(&self) -> Option<&VolumeHeader> {
        self.phase_headers.first()
    }

    /// Voxel size of the first phase echo.
    #[must_use]
    pub fn voxel_size(&self) -> [f64; 3] {
        self.reference_header().map_or([1.0; 3], |h| h.voxel_size)
    }

    /// Voxel count of the first phase echo.
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.reference_header().map_or(0, VolumeHeader::voxel_count)
    }

    /// Keeps the first `k` echoes. Magnitudes and masks are cut only when
    /// they are per-echo.
    pub fn truncate_echoes(&mut self, k: usize) {
        if k >= self.phase.len() {
            return;
        }
        let per_echo = self.phase.len();
        self.phase.truncate(k);
        self.sidecars.truncate(k);
        self.echo_times.truncate(k);
        self.phase_headers.truncate(k);
        if self.magnitude.len() == per_echo {
            self.magnitude.truncate(k);
            self.magnitude_headers.truncate(k);
        }
        if self.masks.len() == per_echo {
            self.masks.truncate(k);
            self.mask_headers.truncate(k);
        }
    }
}

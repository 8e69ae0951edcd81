//! Stage status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The family of work a stage performs.
///
/// Kinds drive resource estimation, DOT colouring and lineage queries; they
/// never change execution semantics except for [`StageKind::Source`] and
/// [`StageKind::Identity`], which a back-end resolves without an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Emits constant values bound at plan time (file paths, echo times).
    Source,
    /// Passes its inputs through unchanged; marks subgraph boundaries.
    Identity,
    /// Reorientation, resampling and phase scaling.
    Preprocess,
    /// Multi-echo combination (ROMEO B0 map, magnitude combination).
    Combine,
    /// Mask construction, filling and erosion.
    Mask,
    /// Phase unwrapping.
    Unwrap,
    /// Unit conversion between phase and frequency.
    Normalize,
    /// Background field removal.
    BackgroundRemoval,
    /// Dipole inversion.
    Inversion,
    /// Barriers joining per-echo results (average, merge, resample).
    Aggregate,
    /// Susceptibility referencing.
    Reference,
    /// SWI, relaxometry, segmentation and analysis collaborators.
    Supplementary,
}

impl Default for StageKind {
    fn default() -> Self {
        Self::Preprocess
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Source => "source",
            Self::Identity => "identity",
            Self::Preprocess => "preprocess",
            Self::Combine => "combine",
            Self::Mask => "mask",
            Self::Unwrap => "unwrap",
            Self::Normalize => "normalize",
            Self::BackgroundRemoval => "background_removal",
            Self::Inversion => "inversion",
            Self::Aggregate => "aggregate",
            Self::Reference => "reference",
            Self::Supplementary => "supplementary",
        };
        f.write_str(s)
    }
}

impl StageKind {
    /// Returns true for kinds a back-end resolves without an executor.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Source | Self::Identity)
    }
}

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed successfully.
    Ok,
    /// Stage was skipped because an upstream stage failed.
    Skip,
    /// Stage failed.
    Fail,
    /// Stage is pending execution.
    Pending,
    /// Stage is currently running.
    Running,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip | Self::Fail)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Source.to_string(), "source");
        assert_eq!(StageKind::BackgroundRemoval.to_string(), "background_removal");
        assert_eq!(StageKind::Inversion.to_string(), "inversion");
    }

    #[test]
    fn test_stage_kind_structural() {
        assert!(StageKind::Source.is_structural());
        assert!(StageKind::Identity.is_structural());
        assert!(!StageKind::Mask.is_structural());
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Ok.is_terminal());
        assert!(StageStatus::Skip.is_terminal());
        assert!(StageStatus::Fail.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Ok).unwrap();
        assert_eq!(json, r#""ok""#);

        let deserialized: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, StageStatus::Ok);
    }

    #[test]
    fn test_stage_kind_serialize() {
        let json = serde_json::to_string(&StageKind::BackgroundRemoval).unwrap();
        assert_eq!(json, r#""background_removal""#);
    }
}

//! Algorithm choices.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dipole inversion family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QsmAlgorithm {
    /// Rapid two-step closed-form inversion.
    #[default]
    Rts,
    /// Total-variation regularised inversion.
    Tv,
    /// Total generalised variation joint solve.
    Tgv,
    /// Learned inversion.
    Nextqsm,
}

impl QsmAlgorithm {
    /// True when the family needs unwrapped phase.
    #[must_use]
    pub fn needs_unwrapping(self) -> bool {
        !matches!(self, Self::Tgv)
    }

    /// True when the family needs a separate background-removal stage.
    #[must_use]
    pub fn needs_background_removal(self) -> bool {
        matches!(self, Self::Rts | Self::Tv)
    }
}

/// Phase unwrapping.
///
/// There is no "none" variant: a missing choice is `Option::None`, which
/// the resolver fills with romeo for families that need unwrapped phase.
/// See [`RunParameters::unwrapping_algorithm`](super::RunParameters::unwrapping_algorithm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnwrappingAlgorithm {
    /// Region-growing quality-guided unwrapping; quantitative.
    Romeo,
    /// Laplacian unwrapping; fast, not quantitative.
    Laplacian,
}

/// Background-field removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BfAlgorithm {
    /// Variable-kernel SHARP; erodes the mask.
    Vsharp,
    /// Projection onto dipole fields; keeps the mask.
    #[default]
    Pdf,
}

/// Mask generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskingAlgorithm {
    /// Threshold a driving map.
    #[default]
    Threshold,
    /// Brain extraction on magnitude.
    Bet,
}

/// Map driving the threshold branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskingInput {
    /// Phase-quality map.
    #[default]
    Phase,
    /// Magnitude.
    Magnitude,
}

/// Hole filling after thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillingAlgorithm {
    /// Gaussian smoothing and rethreshold.
    Gaussian,
    /// Fill enclosed background.
    Morphological,
    /// Gaussian, then morphological.
    #[default]
    Both,
    /// Replace with a BET mask.
    Bet,
}

/// Automatic threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdAlgorithm {
    /// Otsu's method.
    #[default]
    Otsu,
    /// Two-Gaussian fit.
    Gaussian,
}

macro_rules! display_as_serde {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match serde_json::to_value(self) {
                        Ok(serde_json::Value::String(s)) => f.write_str(&s),
                        _ => write!(f, "{self:?}"),
                    }
                }
            }
        )*
    };
}

display_as_serde!(
    QsmAlgorithm,
    UnwrappingAlgorithm,
    BfAlgorithm,
    MaskingAlgorithm,
    MaskingInput,
    FillingAlgorithm,
    ThresholdAlgorithm
);

/// Region whose mean is subtracted from the final map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ReferenceRepr", into = "ReferenceRepr")]
pub enum QsmReference {
    /// Every non-zero voxel.
    Mean,
    /// No referencing.
    #[default]
    None,
    /// Voxels carrying one of these segmentation labels.
    Labels(Vec<i64>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ReferenceRepr {
    Name(String),
    Labels(Vec<i64>),
}

impl TryFrom<ReferenceRepr> for QsmReference {
    type Error = String;

    fn try_from(repr: ReferenceRepr) -> Result<Self, Self::Error> {
        match repr {
            ReferenceRepr::Name(name) => match name.as_str() {
                "mean" => Ok(Self::Mean),
                "none" => Ok(Self::None),
                other => Err(format!("unknown qsm_reference '{other}'")),
            },
            ReferenceRepr::Labels(labels) if labels.is_empty() => {
                Err("qsm_reference label list is empty".to_string())
            }
            ReferenceRepr::Labels(labels) => Ok(Self::Labels(labels)),
        }
    }
}

impl From<QsmReference> for ReferenceRepr {
    fn from(reference: QsmReference) -> Self {
        match reference {
            QsmReference::Mean => Self::Name("mean".to_string()),
            QsmReference::None => Self::Name("none".to_string()),
            QsmReference::Labels(labels) => Self::Labels(labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_round_trip_through_json() {
        assert_eq!(serde_json::to_value(QsmAlgorithm::Nextqsm).unwrap(), json!("nextqsm"));
        assert_eq!(
            serde_json::from_value::<FillingAlgorithm>(json!("morphological")).unwrap(),
            FillingAlgorithm::Morphological
        );
        assert_eq!(BfAlgorithm::Vsharp.to_string(), "vsharp");
    }

    #[test]
    fn test_reference_forms() {
        assert_eq!(serde_json::from_value::<QsmReference>(json!("mean")).unwrap(), QsmReference::Mean);
        assert_eq!(
            serde_json::from_value::<QsmReference>(json!([16, 17])).unwrap(),
            QsmReference::Labels(vec![16, 17])
        );
        assert!(serde_json::from_value::<QsmReference>(json!("median")).is_err());
        assert!(serde_json::from_value::<QsmReference>(json!([])).is_err());
        assert_eq!(serde_json::to_value(QsmReference::None).unwrap(), json!("none"));
    }

    #[test]
    fn test_family_requirements() {
        assert!(QsmAlgorithm::Rts.needs_background_removal());
        assert!(!QsmAlgorithm::Nextqsm.needs_background_removal());
        assert!(!QsmAlgorithm::Tgv.needs_unwrapping());
    }
}

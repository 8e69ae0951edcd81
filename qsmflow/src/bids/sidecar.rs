//! JSON sidecars.

use crate::errors::QsmflowError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RawSidecar {
    #[serde(rename = "EchoTime")]
    echo_time: Option<f64>,
    #[serde(rename = "MagneticFieldStrength")]
    field_strength: Option<f64>,
}

/// The sidecar fields consumed by reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sidecar {
    /// Echo time in seconds.
    pub echo_time: f64,
    /// Field strength in tesla.
    pub field_strength: f64,
}

impl Sidecar {
    /// Parses sidecar JSON text; `origin` is used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, QsmflowError> {
        let raw: RawSidecar = serde_json::from_str(text)
            .map_err(|e| QsmflowError::BadBids(format!("{} is not valid JSON: {e}", origin.display())))?;
        let missing = |field: &str| QsmflowError::BadBids(format!("{} lacks {field}", origin.display()));
        Ok(Self {
            echo_time: raw.echo_time.ok_or_else(|| missing("EchoTime"))?,
            field_strength: raw.field_strength.ok_or_else(|| missing("MagneticFieldStrength"))?,
        })
    }

    /// Reads and parses a sidecar file.
    pub fn read(path: &Path) -> Result<Self, QsmflowError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QsmflowError::BadBids(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text, path)
    }
}

/// Sidecar path of a volume (`.nii[.gz]` replaced by `.json`).
#[must_use]
pub fn sidecar_path(volume: &Path) -> PathBuf {
    let name = volume.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name);
    volume.with_file_name(format!("{stem}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sidecar() {
        let s = Sidecar::parse(r#"{"EchoTime": 0.012, "MagneticFieldStrength": 3}"#, Path::new("a.json")).unwrap();
        assert_eq!(s.echo_time, 0.012);
        assert_eq!(s.field_strength, 3.0);
    }

    #[test]
    fn test_missing_fields_are_bad_bids() {
        let err = Sidecar::parse(r#"{"EchoTime": 0.012}"#, Path::new("a.json")).unwrap_err();
        assert!(matches!(err, QsmflowError::BadBids(m) if m.contains("MagneticFieldStrength")));

        let err = Sidecar::parse("{not json", Path::new("a.json")).unwrap_err();
        assert!(matches!(err, QsmflowError::BadBids(_)));
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/d/sub-1_part-phase_MEGRE.nii.gz")),
            PathBuf::from("/d/sub-1_part-phase_MEGRE.json")
        );
        assert_eq!(sidecar_path(Path::new("/d/x.nii")), PathBuf::from("/d/x.json"));
    }
}

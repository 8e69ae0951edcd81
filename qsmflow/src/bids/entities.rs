//! BIDS filename entities.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z]+)-([a-zA-Z0-9+]+)$").expect("entity pattern is valid"));

#[allow(clippy::expect_used)]
static SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("suffix pattern is valid"));

#[allow(clippy::expect_used)]
static PHASE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^sub-[a-zA-Z0-9]+_.*part-phase.*\.nii(\.gz)?$").expect("phase pattern is valid")
});

const EXTENSIONS: [&str; 5] = [".nii.gz", ".nii", ".json", ".mat", ".csv"];

/// Entities parsed from a BIDS file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BidsEntities {
    /// `sub-` label.
    pub subject: String,
    /// `ses-` label.
    pub session: Option<String>,
    /// `acq-` label.
    pub acq: Option<String>,
    /// `rec-` label.
    pub rec: Option<String>,
    /// `inv-` label.
    pub inv: Option<String>,
    /// `run-` label.
    pub run: Option<String>,
    /// `echo-` index.
    pub echo: Option<u32>,
    /// `part-` label (`mag`, `phase`).
    pub part: Option<String>,
    /// `space-` label.
    pub space: Option<String>,
    /// `label-` label.
    pub label: Option<String>,
    /// `desc-` label.
    pub desc: Option<String>,
    /// Trailing suffix (`MEGRE`, `T1w`, `mask`, `dseg`).
    pub suffix: String,
    /// File extension including the leading dot.
    pub extension: String,
}

impl BidsEntities {
    /// Parses a file name. Returns `None` when it is not a BIDS name.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let extension = EXTENSIONS.iter().find(|ext| file_name.ends_with(*ext))?;
        let stem = &file_name[..file_name.len() - extension.len()];

        let mut tokens: Vec<&str> = stem.split('_').collect();
        let suffix = tokens.pop()?;
        if !SUFFIX.is_match(suffix) {
            return None;
        }

        let mut entities = Self {
            suffix: suffix.to_string(),
            extension: (*extension).to_string(),
            ..Self::default()
        };

        for token in tokens {
            let caps = ENTITY.captures(token)?;
            let value = caps[2].to_string();
            match &caps[1] {
                "sub" => entities.subject = value,
                "ses" => entities.session = Some(value),
                "acq" => entities.acq = Some(value),
                "rec" => entities.rec = Some(value),
                "inv" => entities.inv = Some(value),
                "run" => entities.run = Some(value),
                "echo" => entities.echo = value.parse().ok(),
                "part" => entities.part = Some(value),
                "space" => entities.space = Some(value),
                "label" => entities.label = Some(value),
                "desc" => entities.desc = Some(value),
                _ => {}
            }
        }

        (!entities.subject.is_empty()).then_some(entities)
    }

    /// True for acquisitions in the original space (no `space-` or `space-orig`).
    #[must_use]
    pub fn in_original_space(&self) -> bool {
        self.space.as_deref().map_or(true, |s| s == "orig")
    }

    /// True when the acquisition-level entities agree.
    #[must_use]
    pub fn same_acquisition(&self, other: &Self) -> bool {
        self.acq == other.acq && self.rec == other.rec && self.inv == other.inv && self.run == other.run
    }
}

/// True for `sub-*_part-phase*.nii[.gz]` names.
#[must_use]
pub fn is_phase_file(file_name: &str) -> bool {
    PHASE_FILE.is_match(file_name)
}

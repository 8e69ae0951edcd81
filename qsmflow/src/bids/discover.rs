//! Walks a BIDS tree and groups phase files into reconstruction units.

use super::{is_phase_file, sidecar_path, BidsEntities, HeaderReader, NiftiHeaderReader, ReconstructionUnit, Sidecar};
use crate::errors::QsmflowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ANY_PIPELINE: &str = "*";

/// Entity filters and discovery options. Empty lists match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFilters {
    /// Subject labels.
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Session labels.
    #[serde(default)]
    pub sessions: Vec<String>,
    /// Acquisition labels.
    #[serde(default)]
    pub acquisitions: Vec<String>,
    /// Run labels.
    #[serde(default)]
    pub runs: Vec<String>,
    /// Reconstruction labels.
    #[serde(default)]
    pub recs: Vec<String>,
    /// Inversion labels.
    #[serde(default)]
    pub invs: Vec<String>,
    /// Keep at most this many echoes.
    #[serde(default)]
    pub num_echoes: Option<usize>,
    /// Derivatives pipeline holding existing masks (`*` for any).
    #[serde(default = "default_masks_pipeline")]
    pub existing_masks_pipeline: Option<String>,
    /// Derivatives pipeline holding existing segmentations.
    #[serde(default)]
    pub existing_segmentations_pipeline: Option<String>,
}

fn default_masks_pipeline() -> Option<String> {
    Some(ANY_PIPELINE.to_string())
}

impl Default for DiscoveryFilters {
    fn default() -> Self {
        Self {
            subjects: Vec::new(),
            sessions: Vec::new(),
            acquisitions: Vec::new(),
            runs: Vec::new(),
            recs: Vec::new(),
            invs: Vec::new(),
            num_echoes: None,
            existing_masks_pipeline: default_masks_pipeline(),
            existing_segmentations_pipeline: None,
        }
    }
}

impl DiscoveryFilters {
    /// Restricts to subjects.
    #[must_use]
    pub fn with_subjects(mut self, subjects: &[&str]) -> Self {
        self.subjects = subjects.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Restricts to sessions.
    #[must_use]
    pub fn with_sessions(mut self, sessions: &[&str]) -> Self {
        self.sessions = sessions.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Restricts to acquisitions.
    #[must_use]
    pub fn with_acquisitions(mut self, acquisitions: &[&str]) -> Self {
        self.acquisitions = acquisitions.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Caps the echo count.
    #[must_use]
    pub fn with_num_echoes(mut self, num_echoes: usize) -> Self {
        self.num_echoes = Some(num_echoes);
        self
    }

    /// Sets the existing-mask pipeline; `None` disables mask lookup.
    #[must_use]
    pub fn with_existing_masks_pipeline(mut self, pipeline: Option<&str>) -> Self {
        self.existing_masks_pipeline = pipeline.map(str::to_string);
        self
    }

    /// Sets the existing-segmentation pipeline.
    #[must_use]
    pub fn with_existing_segmentations_pipeline(mut self, pipeline: &str) -> Self {
        self.existing_segmentations_pipeline = Some(pipeline.to_string());
        self
    }

    fn admits(list: &[String], value: Option<&String>) -> bool {
        list.is_empty() || value.is_some_and(|v| list.contains(v))
    }

    fn admits_entities(&self, e: &BidsEntities) -> bool {
        Self::admits(&self.acquisitions, e.acq.as_ref())
            && Self::admits(&self.runs, e.run.as_ref())
            && Self::admits(&self.recs, e.rec.as_ref())
            && Self::admits(&self.invs, e.inv.as_ref())
    }
}

type GroupKey = (Option<String>, Option<String>, Option<String>, String, Option<String>);

/// Produces reconstruction units from a BIDS root.
#[derive(Debug, Clone)]
pub struct RunDiscoverer {
    root: PathBuf,
    filters: DiscoveryFilters,
    headers: Arc<dyn HeaderReader>,
}

impl RunDiscoverer {
    /// Creates a discoverer reading NIfTI headers from disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filters: DiscoveryFilters::default(),
            headers: Arc::new(NiftiHeaderReader),
        }
    }

    /// Sets the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: DiscoveryFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Replaces the header reader.
    #[must_use]
    pub fn with_header_reader(mut self, headers: Arc<dyn HeaderReader>) -> Self {
        self.headers = headers;
        self
    }

    /// Discovers every reconstruction unit, ordered by subject, session
    /// and group.
    ///
    /// # Errors
    ///
    /// `NoInputs` when a subject or session filter matches nothing or no
    /// phase file exists; `BadBids` when a phase file lacks a usable
    /// sidecar.
    pub fn discover(&self) -> Result<Vec<ReconstructionUnit>, QsmflowError> {
        let subjects = self.subject_dirs()?;
        let mut units = Vec::new();
        let mut any_session = false;

        for (subject, subject_dir) in &subjects {
            for (session, anat) in self.session_dirs(subject_dir)? {
                any_session = true;
                units.extend(self.discover_session(subject, session.as_deref(), &anat)?);
            }
        }

        if !self.filters.sessions.is_empty() && !any_session {
            return Err(QsmflowError::NoInputs(format!(
                "no session matches {:?}",
                self.filters.sessions
            )));
        }
        if units.is_empty() {
            return Err(QsmflowError::NoInputs(format!(
                "no phase files under {}",
                self.root.display()
            )));
        }

        info!(root = %self.root.display(), units = units.len(), "Discovered reconstruction units");
        Ok(units)
    }

    fn subject_dirs(&self) -> Result<Vec<(String, PathBuf)>, QsmflowError> {
        let subjects: Vec<(String, PathBuf)> = sorted_dirs(&self.root, "sub-")?
            .into_iter()
            .filter(|(label, _)| self.filters.subjects.is_empty() || self.filters.subjects.contains(label))
            .collect();

        if subjects.is_empty() {
            let what = if self.filters.subjects.is_empty() {
                "no sub-* directories".to_string()
            } else {
                format!("no subject matches {:?}", self.filters.subjects)
            };
            return Err(QsmflowError::NoInputs(format!("{what} in {}", self.root.display())));
        }
        Ok(subjects)
    }

    fn session_dirs(&self, subject_dir: &Path) -> Result<Vec<(Option<String>, PathBuf)>, QsmflowError> {
        let sessions = sorted_dirs(subject_dir, "ses-")?;
        if sessions.is_empty() {
            if !self.filters.sessions.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![(None, subject_dir.join("anat"))]);
        }
        Ok(sessions
            .into_iter()
            .filter(|(label, _)| self.filters.sessions.is_empty() || self.filters.sessions.contains(label))
            .map(|(label, dir)| (Some(label), dir.join("anat")))
            .collect())
    }

    fn discover_session(
        &self,
        subject: &str,
        session: Option<&str>,
        anat: &Path,
    ) -> Result<Vec<ReconstructionUnit>, QsmflowError> {
        let files = sorted_files(anat)?;
        let mut groups: BTreeMap<GroupKey, Vec<(BidsEntities, PathBuf)>> = BTreeMap::new();

        for (name, path) in &files {
            if !is_phase_file(name) {
                continue;
            }
            let Some(entities) = BidsEntities::parse(name) else {
                debug!(file = %name, "Skipping unparsable phase file");
                continue;
            };
            if !self.filters.admits_entities(&entities) {
                continue;
            }
            let key = (
                entities.acq.clone(),
                entities.rec.clone(),
                entities.inv.clone(),
                entities.suffix.clone(),
                entities.run.clone(),
            );
            groups.entry(key).or_default().push((entities, path.clone()));
        }

        let t1w = files
            .iter()
            .find(|(name, _)| {
                BidsEntities::parse(name).is_some_and(|e| e.suffix == "T1w" && e.extension.starts_with(".nii"))
            })
            .map(|(_, path)| path.clone());

        let mut units = Vec::new();
        for ((acq, rec, inv, suffix, run), mut echoes) in groups {
            echoes.sort_by(|(a, pa), (b, pb)| {
                a.echo
                    .unwrap_or(u32::MAX)
                    .cmp(&b.echo.unwrap_or(u32::MAX))
                    .then_with(|| pa.cmp(pb))
            });

            let mut unit = ReconstructionUnit::new(subject, suffix);
            unit.session = session.map(str::to_string);
            unit.acq = acq;
            unit.rec = rec;
            unit.inv = inv;
            unit.run = run;
            unit.t1w = t1w.clone();

            self.attach_echoes(&mut unit, &echoes)?;
            self.attach_masks(&mut unit)?;
            unit.segmentation = self.find_segmentation(&unit)?;

            if let Some(k) = self.filters.num_echoes {
                unit.truncate_echoes(k);
            }

            debug!(
                unit = %unit.id(),
                echoes = unit.echo_count(),
                magnitudes = unit.magnitude.len(),
                masks = unit.masks.len(),
                "Reconstruction unit"
            );
            units.push(unit);
        }
        Ok(units)
    }

    fn attach_echoes(
        &self,
        unit: &mut ReconstructionUnit,
        echoes: &[(BidsEntities, PathBuf)],
    ) -> Result<(), QsmflowError> {
        for (index, (_, phase)) in echoes.iter().enumerate() {
            let sidecar = sidecar_path(phase);
            if !sidecar.is_file() {
                return Err(QsmflowError::BadBids(format!(
                    "{} has no JSON sidecar",
                    phase.display()
                )));
            }
            let meta = Sidecar::read(&sidecar)?;
            if index == 0 {
                unit.field_strength = meta.field_strength;
            }

            unit.phase_headers.push(self.headers.read_header(phase)?);
            unit.echo_times.push(meta.echo_time);
            unit.sidecars.push(sidecar);
            unit.phase.push(phase.clone());

            let magnitude = magnitude_path(phase);
            if magnitude.is_file() {
                unit.magnitude_headers.push(self.headers.read_header(&magnitude)?);
                unit.magnitude.push(magnitude);
            }
        }
        Ok(())
    }

    fn derivative_anat_dirs(&self, pipeline: &str, unit: &ReconstructionUnit) -> Result<Vec<PathBuf>, QsmflowError> {
        let derivatives = self.root.join("derivatives");
        let pipelines = if pipeline == ANY_PIPELINE {
            sorted_dirs(&derivatives, "")?.into_iter().map(|(_, dir)| dir).collect()
        } else {
            vec![derivatives.join(pipeline)]
        };

        Ok(pipelines
            .into_iter()
            .map(|dir| {
                let mut dir = dir.join(format!("sub-{}", unit.subject));
                if let Some(ses) = &unit.session {
                    dir = dir.join(format!("ses-{ses}"));
                }
                dir.join("anat")
            })
            .filter(|dir| dir.is_dir())
            .collect())
    }

    fn attach_masks(&self, unit: &mut ReconstructionUnit) -> Result<(), QsmflowError> {
        let Some(pipeline) = &self.filters.existing_masks_pipeline else {
            return Ok(());
        };
        let reference = BidsEntities {
            acq: unit.acq.clone(),
            rec: unit.rec.clone(),
            inv: unit.inv.clone(),
            run: unit.run.clone(),
            ..BidsEntities::default()
        };

        for dir in self.derivative_anat_dirs(pipeline, unit)? {
            let mut masks: Vec<(BidsEntities, PathBuf)> = sorted_files(&dir)?
                .into_iter()
                .filter_map(|(name, path)| BidsEntities::parse(&name).map(|e| (e, path)))
                .filter(|(e, _)| {
                    e.suffix == "mask"
                        && e.extension.starts_with(".nii")
                        && e.in_original_space()
                        && e.label.as_deref().map_or(true, |l| l == "brain")
                        && e.same_acquisition(&reference)
                })
                .collect();
            if masks.is_empty() {
                continue;
            }
            masks.sort_by(|(a, pa), (b, pb)| {
                a.echo
                    .unwrap_or(u32::MAX)
                    .cmp(&b.echo.unwrap_or(u32::MAX))
                    .then_with(|| pa.cmp(pb))
            });
            for (_, path) in masks {
                unit.mask_headers.push(self.headers.read_header(&path)?);
                unit.masks.push(path);
            }
            // first pipeline with masks wins
            break;
        }
        Ok(())
    }

    fn find_segmentation(&self, unit: &ReconstructionUnit) -> Result<Option<PathBuf>, QsmflowError> {
        let Some(pipeline) = &self.filters.existing_segmentations_pipeline else {
            return Ok(None);
        };
        for dir in self.derivative_anat_dirs(pipeline, unit)? {
            let found = sorted_files(&dir)?.into_iter().find(|(name, _)| {
                BidsEntities::parse(name).is_some_and(|e| {
                    e.suffix == "dseg"
                        && e.extension.starts_with(".nii")
                        && e.space.as_deref().map_or(true, |s| s == "qsm" || s == "orig")
                })
            });
            if let Some((_, path)) = found {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

/// Magnitude counterpart of a phase file.
#[must_use]
pub fn magnitude_path(phase: &Path) -> PathBuf {
    let name = phase.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    phase.with_file_name(name.replace("part-phase", "part-mag"))
}

fn sorted_dirs(parent: &Path, prefix: &str) -> Result<Vec<(String, PathBuf)>, QsmflowError> {
    if !parent.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(label) = name.strip_prefix(prefix) {
            dirs.push((label.to_string(), entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn sorted_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, QsmflowError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

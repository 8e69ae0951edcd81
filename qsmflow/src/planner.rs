//! Top-level planning: discover, resolve and compose one graph per
//! reconstruction unit, then optionally execute the graphs locally.

use crate::backend::{ExecutionReport, ExecutorRegistry, LocalBackend};
use crate::bids::{DiscoveryFilters, HeaderReader, ReconstructionUnit, RunDiscoverer};
use crate::errors::QsmflowError;
use crate::graph::PipelineGraph;
use crate::params::{
    Downgrade, ParameterResolver, PartialRunParameters, PersistedSettings, Resolution, RunParameters, Settings,
};
use crate::workflows::ReconstructionComposer;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// A composed graph with what it was built from.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedGraph {
    /// The unit the graph reconstructs.
    pub unit: ReconstructionUnit,
    /// Resolved parameters and input descriptors.
    pub resolution: Resolution,
    /// The graph.
    pub graph: PipelineGraph,
}

impl PlannedGraph {
    /// Resolver warnings for this unit.
    #[must_use]
    pub fn warnings(&self) -> &[Downgrade] {
        &self.resolution.warnings
    }
}

/// Result of planning a BIDS tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    /// One graph per unit that requests at least one output.
    pub graphs: Vec<PlannedGraph>,
    /// Units skipped because they request nothing.
    pub skipped: Vec<String>,
    /// Where the merged configuration was saved.
    pub settings_path: Option<PathBuf>,
}

impl Plan {
    /// Looks up a planned graph by unit ID.
    #[must_use]
    pub fn graph(&self, unit_id: &str) -> Option<&PlannedGraph> {
        self.graphs.iter().find(|g| g.graph.name() == unit_id)
    }

    /// Total resolver warnings across units.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.graphs.iter().map(|g| g.warnings().len()).sum()
    }
}

/// Drives a whole run from [`Settings`].
#[derive(Debug, Clone)]
pub struct Planner {
    settings: Settings,
    headers: Option<Arc<dyn HeaderReader>>,
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            headers: None,
        }
    }

    /// Replaces the header reader used during discovery.
    #[must_use]
    pub fn with_header_reader(mut self, headers: Arc<dyn HeaderReader>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// The settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Builds every graph.
    ///
    /// Persisted settings in the output directory sit between the premade
    /// and the user's parameters. The merged configuration is written back
    /// after composition succeeds.
    ///
    /// # Errors
    ///
    /// Configuration errors from validation or resolution, layout errors
    /// from discovery, builder errors from composition. A unit requesting
    /// no outputs is skipped with a warning, not an error.
    pub fn plan(&self) -> Result<Plan, QsmflowError> {
        self.settings.validate()?;

        let persisted = if self.settings.persist_settings {
            PersistedSettings::load(&self.settings.output_dir)?
        } else {
            None
        };
        let resolver = match persisted {
            Some(p) => ParameterResolver::new().with_persisted(p.parameters),
            None => ParameterResolver::new(),
        };
        let merged = resolver.merge(&self.settings.parameters)?;
        let units = self.discoverer(discovery_filters(&self.settings.filters, &merged)).discover()?;

        let mut plan = Plan::default();
        for unit in units {
            let resolution = resolver.resolve(&self.settings.parameters, &unit)?;
            match ReconstructionComposer::new(&unit, &resolution).compose() {
                Ok(graph) => plan.graphs.push(PlannedGraph {
                    unit,
                    resolution,
                    graph,
                }),
                Err(QsmflowError::NoOutputs(reason)) => {
                    warn!(unit = %unit.id(), %reason, "Skipping unit");
                    plan.skipped.push(unit.id());
                }
                Err(e) => return Err(e),
            }
        }

        if self.settings.persist_settings {
            plan.settings_path = Some(PersistedSettings::new(merged)?.save(&self.settings.output_dir)?);
        }
        info!(
            graphs = plan.graphs.len(),
            skipped = plan.skipped.len(),
            warnings = plan.warning_count(),
            "Plan ready"
        );
        Ok(plan)
    }

    /// Runs every planned graph on the local back-end, one graph at a time.
    ///
    /// # Errors
    ///
    /// Back-end errors (missing executors, unwritable directories). Stage
    /// failures are reported per graph.
    pub async fn execute(
        &self,
        plan: &Plan,
        registry: Arc<ExecutorRegistry>,
    ) -> Result<Vec<ExecutionReport>, QsmflowError> {
        let backend = LocalBackend::from_settings(&self.settings, registry);
        let mut reports = Vec::with_capacity(plan.graphs.len());
        for planned in &plan.graphs {
            reports.push(backend.run(&planned.graph).await?);
        }
        Ok(reports)
    }

    fn discoverer(&self, filters: DiscoveryFilters) -> RunDiscoverer {
        let discoverer = RunDiscoverer::new(&self.settings.bids_dir).with_filters(filters);
        match &self.headers {
            Some(headers) => discoverer.with_header_reader(headers.clone()),
            None => discoverer,
        }
    }
}

/// Layers the merged parameters that steer discovery onto the configured
/// filters. Echo caps from both sides combine to the smaller one; pipeline
/// names from the parameters win.
fn discovery_filters(filters: &DiscoveryFilters, merged: &PartialRunParameters) -> DiscoveryFilters {
    let mut filters = filters.clone();
    if let Some(n) = merged.num_echoes {
        filters.num_echoes = Some(filters.num_echoes.map_or(n, |k| k.min(n)));
    }
    if let Some(pipeline) = &merged.existing_masks_pipeline {
        filters.existing_masks_pipeline = Some(pipeline.clone());
    }
    if merged.use_existing_segmentations == Some(true) {
        let pipeline = merged
            .existing_segmentations_pipeline
            .clone()
            .or_else(|| filters.existing_segmentations_pipeline.take())
            .unwrap_or_else(|| RunParameters::default().existing_segmentations_pipeline);
        filters.existing_segmentations_pipeline = Some(pipeline);
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::{InMemoryHeaderReader, VolumeHeader};
    use crate::testing::BidsFixture;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn planner(bids: &Path, out: &Path, parameters: PartialRunParameters) -> Planner {
        let settings = Settings::new(bids, out).with_parameters(parameters);
        Planner::new(settings).with_header_reader(Arc::new(InMemoryHeaderReader::new(VolumeHeader::axial(
            [32, 32, 16],
            [1.0, 1.0, 1.0],
        ))))
    }

    #[test]
    fn test_one_graph_per_unit() {
        let bids = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for subject in ["1", "2"] {
            BidsFixture::new(bids.path())
                .subject(subject)
                .echoes(&[0.004, 0.012])
                .with_magnitude()
                .write()
                .unwrap();
        }

        let plan = planner(bids.path(), out.path(), PartialRunParameters::new()).plan().unwrap();
        let names: Vec<&str> = plan.graphs.iter().map(|g| g.graph.name()).collect();
        assert_eq!(names, vec!["sub-1", "sub-2"]);
        assert!(plan.skipped.is_empty());
        assert!(plan.graph("sub-2").unwrap().graph.declared_output("qsm").is_some());
        assert_eq!(plan.settings_path, Some(out.path().join("settings.json")));
    }

    #[test]
    fn test_persisted_settings_feed_the_next_plan() {
        let bids = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        BidsFixture::new(bids.path()).echoes(&[0.004, 0.012]).with_magnitude().write().unwrap();

        let first = planner(bids.path(), out.path(), PartialRunParameters::new().with_two_pass(false))
            .plan()
            .unwrap();
        assert!(!first.graphs[0].resolution.params.two_pass);

        let second = planner(bids.path(), out.path(), PartialRunParameters::new()).plan().unwrap();
        assert!(!second.graphs[0].resolution.params.two_pass);
        assert!(second.graphs[0].graph.stages_with_prefix("qsm_intermediate").is_empty());
    }

    #[test]
    fn test_num_echoes_parameter_caps_discovered_echoes() {
        let bids = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        BidsFixture::new(bids.path())
            .echoes(&[0.004, 0.012, 0.020])
            .with_magnitude()
            .write()
            .unwrap();
        let one_echo = PartialRunParameters {
            num_echoes: Some(1),
            ..PartialRunParameters::new().with_two_pass(false)
        };

        let plan = planner(bids.path(), out.path(), one_echo).plan().unwrap();
        let planned = &plan.graphs[0];
        assert_eq!(planned.unit.echo_count(), 1);
        assert_eq!(planned.resolution.inputs.echo_count, 1);
        assert!(planned.graph.contains("qsm.unwrap.e0"));
        assert!(!planned.graph.contains("qsm.unwrap.e1"));
        assert!(!planned.graph.contains("qsm.unwrap.e2"));
    }

    #[test]
    fn test_masks_pipeline_parameter_selects_derivatives() {
        let bids = tempfile::tempdir().unwrap();
        BidsFixture::new(bids.path())
            .echoes(&[0.004, 0.012])
            .with_magnitude()
            .with_existing_mask("qsmxt")
            .write()
            .unwrap();
        let from = |pipeline: &str| PartialRunParameters {
            existing_masks_pipeline: Some(pipeline.to_string()),
            ..PartialRunParameters::new().with_existing_masks(true)
        };

        let out = tempfile::tempdir().unwrap();
        let elsewhere = planner(bids.path(), out.path(), from("other")).plan().unwrap();
        assert!(elsewhere.graphs[0].unit.masks.is_empty());
        assert!(!elsewhere.graphs[0].resolution.params.use_existing_masks);

        let out = tempfile::tempdir().unwrap();
        let matching = planner(bids.path(), out.path(), from("qsmxt")).plan().unwrap();
        assert_eq!(matching.graphs[0].unit.masks.len(), 1);
        assert!(matching.graphs[0].resolution.params.use_existing_masks);
    }

    #[test]
    fn test_existing_segmentations_parameter_reaches_discovery() {
        let bids = tempfile::tempdir().unwrap();
        BidsFixture::new(bids.path())
            .echoes(&[0.004, 0.012])
            .with_magnitude()
            .with_existing_segmentation("fastsurfer")
            .write()
            .unwrap();

        let out = tempfile::tempdir().unwrap();
        let off = planner(bids.path(), out.path(), PartialRunParameters::new()).plan().unwrap();
        assert_eq!(off.graphs[0].unit.segmentation, None);

        let out = tempfile::tempdir().unwrap();
        let on = PartialRunParameters {
            use_existing_segmentations: Some(true),
            existing_segmentations_pipeline: Some("fastsurfer".to_string()),
            ..PartialRunParameters::default()
        };
        let plan = planner(bids.path(), out.path(), on).plan().unwrap();
        let planned = &plan.graphs[0];
        assert!(planned.unit.segmentation.is_some());
        assert!(planned.resolution.params.use_existing_segmentations);
        assert!(planned.resolution.inputs.has_segmentation);
    }

    #[test]
    fn test_unit_without_outputs_is_skipped() {
        let bids = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        BidsFixture::new(bids.path()).echoes(&[0.012]).write().unwrap();
        let nothing = PartialRunParameters {
            do_qsm: Some(false),
            do_swi: Some(false),
            do_t2starmap: Some(false),
            do_r2starmap: Some(false),
            do_segmentation: Some(false),
            do_analysis: Some(false),
            ..PartialRunParameters::default()
        };

        let plan = planner(bids.path(), out.path(), nothing).plan().unwrap();
        assert!(plan.graphs.is_empty());
        assert_eq!(plan.skipped, vec!["sub-1".to_string()]);
    }

    #[test]
    fn test_missing_bids_tree_fails() {
        let bids = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let err = planner(bids.path(), out.path(), PartialRunParameters::new())
            .plan()
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(!out.path().join("settings.json").exists());
    }
}

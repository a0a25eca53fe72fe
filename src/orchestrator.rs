//! Round orchestration state machine
//!
//! Drives the fit/evaluate cycle: sample clients, hand out parameters,
//! aggregate returned updates, evaluate, and promote the best cluster
//! model. The orchestrator owns every sub-component and the results
//! directory; callers supply the client population and their round
//! results, transport is out of scope.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::aggregate::ClusterAggregator;
use crate::assignment::ClusterAssignmentStore;
use crate::clustering::SimilarityClusterer;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::evaluation::MetricsEvaluator;
use crate::model::ParameterSet;
use crate::poison::{PoisonDetector, PoisonReport};
use crate::resources::{ResourceLog, ResourceSampler, StaticResourceSampler};
use crate::storage::{self, ResultsDir};
use crate::types::{ClientId, ClientUpdate};

/// Where the orchestrator is within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Selecting fit participants and building instructions
    ConfiguringFit,
    /// Waiting for fit results
    CollectingFit,
    /// Aggregating fit results
    AggregatingFit,
    /// Selecting evaluate participants
    ConfiguringEvaluate,
    /// Waiting for evaluate results
    CollectingEvaluate,
    /// Aggregating evaluate results
    AggregatingEvaluate,
}

/// Work order for one client's fit step.
#[derive(Debug, Clone)]
pub struct FitInstruction {
    /// Target client
    pub client_id: ClientId,
    /// Round the instruction belongs to
    pub round: u64,
    /// Parameters the client starts training from
    pub parameters: ParameterSet,
}

/// Work order for one client's evaluate step.
#[derive(Debug, Clone)]
pub struct EvaluateInstruction {
    /// Target client
    pub client_id: ClientId,
    /// Round the instruction belongs to
    pub round: u64,
    /// Parameters the client evaluates
    pub parameters: ParameterSet,
}

/// The federated round driver.
pub struct RoundOrchestrator {
    config: CoordinatorConfig,
    clusterer: SimilarityClusterer,
    aggregator: ClusterAggregator,
    assignments: ClusterAssignmentStore,
    evaluator: MetricsEvaluator,
    detector: PoisonDetector,
    resource_log: ResourceLog,
    sampler: Box<dyn ResourceSampler>,
    results: ResultsDir,
    cluster_models: BTreeMap<usize, ParameterSet>,
    global_model: ParameterSet,
    phase: RoundPhase,
    rng: StdRng,
}

impl RoundOrchestrator {
    /// Creates an orchestrator persisting into an existing results
    /// directory.
    pub fn new(config: CoordinatorConfig, results: ResultsDir) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let global_model = ParameterSet::zeroed(config.model_type);
        Ok(Self {
            clusterer: SimilarityClusterer::new(config.num_clusters),
            aggregator: ClusterAggregator::new(config.num_clusters),
            assignments: ClusterAssignmentStore::new(config.clustering_frequency, &results),
            evaluator: MetricsEvaluator::new(
                config.model_type,
                config.num_clusters,
                config.dynamic_grouping,
                config.selection_metric,
                &results,
            ),
            detector: PoisonDetector::new(config.model_type, &results),
            resource_log: ResourceLog::new(&results)?,
            sampler: Box::<StaticResourceSampler>::default(),
            results,
            cluster_models: BTreeMap::new(),
            global_model,
            phase: RoundPhase::ConfiguringFit,
            config,
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Creates an orchestrator with a fresh timestamped results
    /// directory under `base`.
    pub fn create(config: CoordinatorConfig, base: &Path) -> Result<Self, CoordinatorError> {
        let results = ResultsDir::create(base, config.model_type)?;
        Self::new(config, results)
    }

    /// Seeds client sampling and clustering for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.clusterer = self.clusterer.with_seed(seed);
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Replaces the resource sampler.
    pub fn with_resource_sampler(mut self, sampler: Box<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Current phase within the round.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// The results directory of this run.
    pub fn results_dir(&self) -> &ResultsDir {
        &self.results
    }

    /// The current global model.
    pub fn global_model(&self) -> &ParameterSet {
        &self.global_model
    }

    /// Aggregated cluster models of the last fit round.
    pub fn cluster_models(&self) -> &BTreeMap<usize, ParameterSet> {
        &self.cluster_models
    }

    /// The untrained starting parameters for this model type.
    pub fn initialize_parameters(&self) -> ParameterSet {
        ParameterSet::zeroed(self.config.model_type)
    }

    /// Fit sample size and required availability for `num_available`
    /// clients: at least `min_fit_clients`, otherwise the configured
    /// fraction.
    pub fn num_fit_clients(&self, num_available: usize) -> (usize, usize) {
        let fraction = (num_available as f64 * self.config.fraction_fit) as usize;
        (
            fraction.max(self.config.min_fit_clients),
            self.config.min_available_clients,
        )
    }

    /// Evaluate sample size and required availability.
    pub fn num_evaluation_clients(&self, num_available: usize) -> (usize, usize) {
        let fraction = (num_available as f64 * self.config.fraction_evaluate) as usize;
        (
            fraction.max(self.config.min_evaluate_clients),
            self.config.min_available_clients,
        )
    }

    /// Samples fit participants and builds their instructions.
    ///
    /// From round 2 onward in dynamic grouping mode, a client mapped to
    /// a cluster with an aggregated model trains on that cluster model;
    /// everyone else gets the global model. Returns no instructions
    /// when too few clients are available.
    pub fn configure_fit(&mut self, round: u64, available: &[ClientId]) -> Vec<FitInstruction> {
        self.phase = RoundPhase::ConfiguringFit;
        if available.len() < self.config.min_fit_clients {
            warn!(
                round,
                available = available.len(),
                required = self.config.min_fit_clients,
                "not enough clients for fit"
            );
            return Vec::new();
        }

        let (sample_size, _) = self.num_fit_clients(available.len());
        let sampled: Vec<ClientId> = available
            .choose_multiple(&mut self.rng, sample_size.min(available.len()))
            .cloned()
            .collect();
        info!(round, sampled = sampled.len(), "configuring fit");

        let instructions = sampled
            .into_iter()
            .map(|client_id| {
                let parameters = self.parameters_for(round, &client_id);
                FitInstruction {
                    client_id,
                    round,
                    parameters,
                }
            })
            .collect();
        self.phase = RoundPhase::CollectingFit;
        instructions
    }

    /// Aggregates one fit round's results.
    ///
    /// In dynamic grouping mode this runs the clustering cadence,
    /// produces per-cluster models plus their global mean, and persists
    /// the round's assignments. Otherwise it is a plain unweighted mean.
    /// Returns `(None, empty)` when no results arrived.
    pub fn aggregate_fit(
        &mut self,
        round: u64,
        results: &[ClientUpdate],
    ) -> Result<(Option<ParameterSet>, BTreeMap<usize, ParameterSet>), CoordinatorError> {
        self.phase = RoundPhase::AggregatingFit;
        if results.is_empty() {
            warn!(round, "no fit results to aggregate");
            self.phase = RoundPhase::ConfiguringEvaluate;
            return Ok((None, BTreeMap::new()));
        }

        let parameter_sets: Vec<ParameterSet> =
            results.iter().map(|u| u.parameters.clone()).collect();

        if !self.config.dynamic_grouping {
            let global = self.aggregator.aggregate_global(&parameter_sets);
            self.global_model = global.clone();
            self.phase = RoundPhase::ConfiguringEvaluate;
            return Ok((Some(global), BTreeMap::new()));
        }

        let fresh = if self.assignments.is_clustering_round(round) {
            Some(self.clusterer.assign(&parameter_sets))
        } else {
            None
        };
        let labels = self
            .assignments
            .resolve_round_labels(round, results.len(), fresh)?;

        let aggregate = self.aggregator.aggregate(&parameter_sets, &labels);
        self.cluster_models = aggregate.cluster_models.clone();
        self.global_model = aggregate.global.clone();

        let client_ids: Vec<ClientId> = results.iter().map(|u| u.client_id.clone()).collect();
        self.assignments.record_assignments(round, &client_ids)?;

        info!(
            round,
            clusters = self.cluster_models.len(),
            "fit round aggregated"
        );
        self.phase = RoundPhase::ConfiguringEvaluate;
        Ok((Some(aggregate.global), aggregate.cluster_models))
    }

    /// Samples evaluate participants and builds their instructions.
    ///
    /// Returns no instructions when server-side evaluation is disabled
    /// (`fraction_evaluate == 0`) or too few clients are available.
    pub fn configure_evaluate(
        &mut self,
        round: u64,
        available: &[ClientId],
    ) -> Vec<EvaluateInstruction> {
        self.phase = RoundPhase::ConfiguringEvaluate;
        if self.config.fraction_evaluate == 0.0 {
            return Vec::new();
        }
        if available.len() < self.config.min_evaluate_clients {
            warn!(
                round,
                available = available.len(),
                required = self.config.min_evaluate_clients,
                "not enough clients for evaluate"
            );
            return Vec::new();
        }

        let (sample_size, _) = self.num_evaluation_clients(available.len());
        let sampled: Vec<ClientId> = available
            .choose_multiple(&mut self.rng, sample_size.min(available.len()))
            .cloned()
            .collect();

        let instructions = sampled
            .into_iter()
            .map(|client_id| {
                let parameters = self.parameters_for(round, &client_id);
                EvaluateInstruction {
                    client_id,
                    round,
                    parameters,
                }
            })
            .collect();
        self.phase = RoundPhase::CollectingEvaluate;
        instructions
    }

    /// Aggregates one evaluate round's results.
    ///
    /// Records resource consumption, aggregates and persists the
    /// weighted metrics, and in dynamic grouping mode re-derives the
    /// best cluster from the evaluation log and promotes its model to
    /// the best-model artifact. Returns the globally weighted accuracy.
    pub fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: &[ClientUpdate],
    ) -> Result<Option<f64>, CoordinatorError> {
        self.phase = RoundPhase::AggregatingEvaluate;
        if results.is_empty() {
            warn!(round, "no evaluate results to aggregate");
            self.phase = RoundPhase::ConfiguringFit;
            return Ok(None);
        }

        let samples: Vec<_> = results
            .iter()
            .map(|u| (u.client_id.clone(), self.sampler.sample(&u.client_id)))
            .collect();
        self.resource_log.record_round(round, &samples)?;

        let labels: Option<Vec<usize>> = if self.config.dynamic_grouping {
            Some(self.assignments.labels().to_vec())
        } else {
            None
        };
        let (accuracy, _) = self
            .evaluator
            .aggregate_round(round, results, labels.as_deref())?;

        if self.config.dynamic_grouping {
            let (best_cluster, value) = self.evaluator.select_best_cluster(round)?;
            let model = self
                .cluster_models
                .get(&best_cluster)
                .ok_or(CoordinatorError::ClusterModelUnavailable {
                    cluster: best_cluster,
                })?;
            storage::save_parameter_set(&self.results.file(storage::BEST_CLUSTER_MODEL), model)?;
            info!(round, best_cluster, value, "best cluster model promoted");
        }

        self.phase = RoundPhase::ConfiguringFit;
        Ok(accuracy)
    }

    /// Audits a round's fit results for a potentially poisoned client.
    pub fn detect_potential_poisoned_client(
        &self,
        round: u64,
        results: &[ClientUpdate],
    ) -> Result<Option<PoisonReport>, CoordinatorError> {
        self.detector.detect(round, results)
    }

    /// Parameters handed to one client: its cluster model from round 2
    /// onward in dynamic mode, otherwise the global model.
    fn parameters_for(&self, round: u64, client_id: &str) -> ParameterSet {
        if self.config.dynamic_grouping && round > 1 {
            if let Some(cluster) = self.assignments.lookup(client_id) {
                if let Some(model) = self.cluster_models.get(&cluster) {
                    return model.clone();
                }
            }
        }
        self.global_model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tensor;
    use crate::types::ClientMetrics;
    use tempfile::tempdir;

    fn orchestrator(config: CoordinatorConfig, dir: &Path) -> RoundOrchestrator {
        let results = ResultsDir::at(dir.join("run")).unwrap();
        RoundOrchestrator::new(config, results).unwrap().with_seed(7)
    }

    fn update(id: &str, values: Vec<f32>) -> ClientUpdate {
        ClientUpdate {
            client_id: id.to_string(),
            parameters: ParameterSet::new(vec![Tensor::new(vec![values.len()], values)]),
            num_examples: 10,
            metrics: ClientMetrics {
                accuracy: 0.5,
                f1_score: 0.5,
                log_loss: 0.5,
            },
        }
    }

    fn ids(n: usize) -> Vec<ClientId> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_num_fit_clients_fraction() {
        let dir = tempdir().unwrap();
        let o = orchestrator(
            CoordinatorConfig::default().with_fraction_fit(0.5),
            dir.path(),
        );
        assert_eq!(o.num_fit_clients(10), (5, 2));
    }

    #[test]
    fn test_num_fit_clients_minimum_floor() {
        let dir = tempdir().unwrap();
        let o = orchestrator(
            CoordinatorConfig::default().with_fraction_fit(0.1),
            dir.path(),
        );
        // floor(10 * 0.1) = 1 is below the minimum of 2
        assert_eq!(o.num_fit_clients(10), (2, 2));
    }

    #[test]
    fn test_configure_fit_below_minimum() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(CoordinatorConfig::default(), dir.path());
        assert!(o.configure_fit(1, &ids(1)).is_empty());
    }

    #[test]
    fn test_configure_fit_samples_fraction() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(
            CoordinatorConfig::default().with_fraction_fit(0.5),
            dir.path(),
        );
        let instructions = o.configure_fit(1, &ids(10));
        assert_eq!(instructions.len(), 5);
        assert_eq!(o.phase(), RoundPhase::CollectingFit);
        // Round 1 always hands out the global (untrained) model.
        for instruction in &instructions {
            assert_eq!(instruction.parameters, *o.global_model());
        }
    }

    #[test]
    fn test_aggregate_fit_empty() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(CoordinatorConfig::default(), dir.path());
        let (global, clusters) = o.aggregate_fit(1, &[]).unwrap();
        assert!(global.is_none());
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_aggregate_fit_plain_mean() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(CoordinatorConfig::default(), dir.path());
        let (global, clusters) = o
            .aggregate_fit(1, &[update("0", vec![1.0, 1.0]), update("1", vec![3.0, 3.0])])
            .unwrap();
        assert_eq!(global.unwrap().tensors[0].data, vec![2.0, 2.0]);
        assert!(clusters.is_empty());
        assert_eq!(o.global_model().tensors[0].data, vec![2.0, 2.0]);
    }

    #[test]
    fn test_dynamic_fit_round_produces_cluster_models() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(
            CoordinatorConfig::default()
                .with_dynamic_grouping(true)
                .with_num_clusters(2),
            dir.path(),
        );
        let results = vec![
            update("0", vec![1.0, 0.0]),
            update("1", vec![1.0, 0.0]),
            update("2", vec![0.0, 1.0]),
            update("3", vec![0.0, 1.0]),
        ];
        let (global, clusters) = o.aggregate_fit(1, &results).unwrap();
        assert!(global.is_some());
        assert!(!clusters.is_empty());
        assert_eq!(o.cluster_models().len(), clusters.len());
        // Every client is mapped after the clustering round.
        for id in ids(4) {
            assert!(o.assignments.lookup(&id).is_some());
        }
    }

    #[test]
    fn test_configure_evaluate_disabled() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(
            CoordinatorConfig::default().with_fraction_evaluate(0.0),
            dir.path(),
        );
        assert!(o.configure_evaluate(1, &ids(10)).is_empty());
    }

    #[test]
    fn test_aggregate_evaluate_empty() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(CoordinatorConfig::default(), dir.path());
        assert!(o.aggregate_evaluate(1, &[]).unwrap().is_none());
        assert_eq!(o.phase(), RoundPhase::ConfiguringFit);
    }

    #[test]
    fn test_aggregate_evaluate_plain_accuracy() {
        let dir = tempdir().unwrap();
        let mut o = orchestrator(CoordinatorConfig::default(), dir.path());
        let accuracy = o
            .aggregate_evaluate(1, &[update("0", vec![1.0]), update("1", vec![2.0])])
            .unwrap();
        assert!((accuracy.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sampling_deterministic_with_seed() {
        let dir1 = tempdir().unwrap();
        let dir2 = tempdir().unwrap();
        let config = CoordinatorConfig::default().with_fraction_fit(0.5);
        let mut a = orchestrator(config.clone(), dir1.path());
        let mut b = orchestrator(config, dir2.path());
        let picked_a: Vec<ClientId> = a
            .configure_fit(1, &ids(20))
            .into_iter()
            .map(|i| i.client_id)
            .collect();
        let picked_b: Vec<ClientId> = b
            .configure_fit(1, &ids(20))
            .into_iter()
            .map(|i| i.client_id)
            .collect();
        assert_eq!(picked_a, picked_b);
    }
}

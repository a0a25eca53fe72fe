//! Coordinator configuration
//!
//! Static parameters are set at construction; the two runtime knobs
//! (`dynamic_grouping`, `clustering_frequency`) can additionally be
//! overridden from key=value text, matching the deployment's plain-text
//! config files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::CoordinatorError;
use crate::evaluation::SelectionMetric;
use crate::model::ModelType;

/// Configuration for the round orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Fraction of available clients sampled for fit rounds
    pub fraction_fit: f64,
    /// Fraction of available clients sampled for evaluate rounds
    pub fraction_evaluate: f64,
    /// Minimum clients required for a fit round
    pub min_fit_clients: usize,
    /// Minimum clients required for an evaluate round
    pub min_evaluate_clients: usize,
    /// Minimum clients that must be available overall
    pub min_available_clients: usize,
    /// Model kind the coordinator manages
    pub model_type: ModelType,
    /// Fixed number of clusters; never changes after construction
    pub num_clusters: usize,
    /// Whether similarity clustering and per-cluster aggregation run
    pub dynamic_grouping: bool,
    /// Re-cluster every N rounds (round 1 always clusters)
    pub clustering_frequency: u64,
    /// Metric used by best-cluster selection
    pub selection_metric: SelectionMetric,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
            model_type: ModelType::ImageClassification,
            num_clusters: 3,
            dynamic_grouping: false,
            clustering_frequency: 1,
            selection_metric: SelectionMetric::Accuracy,
        }
    }
}

impl CoordinatorConfig {
    /// Sets the model type.
    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    /// Sets the cluster count.
    pub fn with_num_clusters(mut self, num_clusters: usize) -> Self {
        self.num_clusters = num_clusters;
        self
    }

    /// Enables or disables dynamic grouping.
    pub fn with_dynamic_grouping(mut self, enabled: bool) -> Self {
        self.dynamic_grouping = enabled;
        self
    }

    /// Sets the clustering cadence.
    pub fn with_clustering_frequency(mut self, frequency: u64) -> Self {
        self.clustering_frequency = frequency;
        self
    }

    /// Sets the fit sampling fraction.
    pub fn with_fraction_fit(mut self, fraction: f64) -> Self {
        self.fraction_fit = fraction;
        self
    }

    /// Sets the evaluate sampling fraction.
    pub fn with_fraction_evaluate(mut self, fraction: f64) -> Self {
        self.fraction_evaluate = fraction;
        self
    }

    /// Sets the best-cluster selection metric.
    pub fn with_selection_metric(mut self, metric: SelectionMetric) -> Self {
        self.selection_metric = metric;
        self
    }

    /// Applies key=value overrides from plain text.
    ///
    /// Recognised keys: `dynamic_grouping` (0 or 1) and
    /// `clustering_frequency` (integer >= 1). Unknown keys are ignored
    /// so deployments can share one config file across components.
    pub fn apply_key_values(&mut self, text: &str) -> Result<(), CoordinatorError> {
        for line in text.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "dynamic_grouping" => {
                    self.dynamic_grouping = match value.trim() {
                        "0" => false,
                        "1" => true,
                        other => {
                            return Err(CoordinatorError::Config(format!(
                                "dynamic_grouping must be 0 or 1, got {other}"
                            )))
                        }
                    };
                }
                "clustering_frequency" => {
                    let frequency: u64 = value.trim().parse().map_err(|_| {
                        CoordinatorError::Config(format!(
                            "clustering_frequency must be an integer, got {}",
                            value.trim()
                        ))
                    })?;
                    if frequency == 0 {
                        return Err(CoordinatorError::Config(
                            "clustering_frequency must be >= 1".to_string(),
                        ));
                    }
                    self.clustering_frequency = frequency;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies key=value overrides from a file.
    pub fn apply_key_value_file(&mut self, path: &Path) -> Result<(), CoordinatorError> {
        let text = std::fs::read_to_string(path)?;
        self.apply_key_values(&text)
    }

    /// Validates internal consistency.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.num_clusters == 0 {
            return Err(CoordinatorError::Config(
                "num_clusters must be >= 1".to_string(),
            ));
        }
        if self.clustering_frequency == 0 {
            return Err(CoordinatorError::Config(
                "clustering_frequency must be >= 1".to_string(),
            ));
        }
        for (name, fraction) in [
            ("fraction_fit", self.fraction_fit),
            ("fraction_evaluate", self.fraction_evaluate),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(CoordinatorError::Config(format!(
                    "{name} must be within [0, 1], got {fraction}"
                )));
            }
        }
        Ok(())
    }
}

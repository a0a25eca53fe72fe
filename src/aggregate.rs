//! Per-cluster and global parameter aggregation
//!
//! Aggregation is an unweighted element-wise mean: every submitted
//! update counts equally regardless of `num_examples`. (Evaluation, in
//! contrast, is importance-weighted; the asymmetry is deliberate and
//! must not be "fixed" here.)

use std::collections::BTreeMap;
use tracing::debug;

use crate::model::ParameterSet;

/// Output of one clustering round's aggregation.
#[derive(Debug, Clone)]
pub struct ClusterAggregate {
    /// Aggregated model per non-empty cluster
    pub cluster_models: BTreeMap<usize, ParameterSet>,
    /// Mean across cluster models, used for unmapped clients
    pub global: ParameterSet,
}

/// Combines client parameter sets into cluster models and a fallback
/// global model.
#[derive(Debug, Clone)]
pub struct ClusterAggregator {
    num_clusters: usize,
}

impl ClusterAggregator {
    /// Creates an aggregator for a fixed cluster count.
    pub fn new(num_clusters: usize) -> Self {
        Self { num_clusters }
    }

    /// Aggregates parameter sets grouped by their cluster labels.
    ///
    /// Labels outside `[0, num_clusters)` are ignored. If every cluster
    /// ends up empty, the global model degrades to zero tensors shaped
    /// like the first submitted update.
    pub fn aggregate(&self, parameter_sets: &[ParameterSet], labels: &[usize]) -> ClusterAggregate {
        let mut cluster_models = BTreeMap::new();
        for cluster in 0..self.num_clusters {
            let members: Vec<&ParameterSet> = parameter_sets
                .iter()
                .zip(labels.iter())
                .filter(|(_, &label)| label == cluster)
                .map(|(params, _)| params)
                .collect();
            if members.is_empty() {
                continue;
            }
            debug!(cluster, members = members.len(), "aggregating cluster");
            cluster_models.insert(cluster, mean_parameter_sets(&members));
        }

        let global = if cluster_models.is_empty() {
            parameter_sets
                .first()
                .map(ParameterSet::zeros_like)
                .unwrap_or_default()
        } else {
            let centers: Vec<&ParameterSet> = cluster_models.values().collect();
            mean_parameter_sets(&centers)
        };

        ClusterAggregate {
            cluster_models,
            global,
        }
    }

    /// Plain global aggregation: unweighted mean across all updates.
    pub fn aggregate_global(&self, parameter_sets: &[ParameterSet]) -> ParameterSet {
        let refs: Vec<&ParameterSet> = parameter_sets.iter().collect();
        mean_parameter_sets(&refs)
    }
}

/// Element-wise arithmetic mean across parameter sets.
///
/// All sets must share tensor shapes; position `t` of the result is the
/// mean of every member's tensor `t`.
pub fn mean_parameter_sets(sets: &[&ParameterSet]) -> ParameterSet {
    let Some(first) = sets.first() else {
        return ParameterSet::default();
    };
    let mut result = first.zeros_like();
    for set in sets {
        for (accumulated, tensor) in result.tensors.iter_mut().zip(set.tensors.iter()) {
            for (sum, &value) in accumulated.data.iter_mut().zip(tensor.data.iter()) {
                *sum += value;
            }
        }
    }
    let count = sets.len() as f32;
    for tensor in &mut result.tensors {
        for value in &mut tensor.data {
            *value /= count;
        }
    }
    result
}

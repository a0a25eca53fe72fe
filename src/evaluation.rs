//! Metric aggregation, persistence, and best-cluster selection
//!
//! Evaluation is importance-weighted by `num_examples` (unlike
//! aggregation, which is unweighted). Per-client raw scores go to three
//! score logs; the round summary goes to the evaluation log using a
//! fixed textual grammar. Best-cluster selection deliberately re-reads
//! the persisted log rather than any in-memory summary, so selection
//! can resume independently of a live process; the log grammar is the
//! compatibility contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::CoordinatorError;
use crate::model::ModelType;
use crate::storage::{self, ResultsDir};
use crate::types::{numeric_cid, ClientId, ClientUpdate};

/// Metric maximised by best-cluster selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionMetric {
    /// Classification accuracy (default)
    #[default]
    Accuracy,
    /// Macro F1 score
    F1Score,
    /// Log loss (still maximised; preserved from the original)
    LogLoss,
}

impl fmt::Display for SelectionMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMetric::Accuracy => write!(f, "Accuracy"),
            SelectionMetric::F1Score => write!(f, "F1 Score"),
            SelectionMetric::LogLoss => write!(f, "Log Loss"),
        }
    }
}

/// One aggregated metric record (global or per cluster).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Weighted accuracy
    pub accuracy: f64,
    /// Weighted F1 score
    pub f1_score: f64,
    /// Weighted log loss
    pub log_loss: f64,
}

impl MetricRecord {
    fn get(&self, metric: SelectionMetric) -> f64 {
        match metric {
            SelectionMetric::Accuracy => self.accuracy,
            SelectionMetric::F1Score => self.f1_score,
            SelectionMetric::LogLoss => self.log_loss,
        }
    }
}

/// A round's aggregated metrics: one global record, or one per cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMetricSummary {
    /// Round number
    pub round: u64,
    /// Global weighted averages (classification results only)
    pub aggregated: Option<MetricRecord>,
    /// Per-cluster weighted averages, index = cluster label
    pub groups: Option<Vec<MetricRecord>>,
}

/// Aggregates per-client evaluation metrics and re-derives the best
/// cluster from the persisted summary.
#[derive(Debug)]
pub struct MetricsEvaluator {
    model_type: ModelType,
    num_clusters: usize,
    selection_metric: SelectionMetric,
    accuracy_path: PathBuf,
    f1_path: PathBuf,
    logloss_path: PathBuf,
    evaluation_path: PathBuf,
}

impl MetricsEvaluator {
    /// Creates an evaluator persisting into `results`.
    pub fn new(
        model_type: ModelType,
        num_clusters: usize,
        dynamic_grouping: bool,
        selection_metric: SelectionMetric,
        results: &ResultsDir,
    ) -> Self {
        let evaluation_file = if dynamic_grouping {
            storage::EVALUATION_LOSS
        } else {
            storage::AGGREGATED_EVALUATION_LOSS
        };
        Self {
            model_type,
            num_clusters,
            selection_metric,
            accuracy_path: results.file(storage::ACCURACY_SCORES),
            f1_path: results.file(storage::F1_SCORES),
            logloss_path: results.file(storage::LOGLOSS_SCORES),
            evaluation_path: results.file(evaluation_file),
        }
    }

    /// Path of the evaluation summary log.
    pub fn evaluation_log_path(&self) -> &Path {
        &self.evaluation_path
    }

    /// Aggregates one evaluate round and persists every record.
    ///
    /// `labels` carries the current cluster labels in dynamic grouping
    /// mode; when present, a per-cluster summary is written instead of
    /// the global one. Returns the globally weighted accuracy (None for
    /// model types whose metrics are not aggregated).
    pub fn aggregate_round(
        &self,
        round: u64,
        results: &[ClientUpdate],
        labels: Option<&[usize]>,
    ) -> Result<(Option<f64>, RoundMetricSummary), CoordinatorError> {
        let mut scores: Vec<(ClientId, f64, f64, f64)> = Vec::new();
        let mut totals = MetricRecord::default();
        let mut total_examples: u64 = 0;

        for update in results {
            // Anomaly-detection metrics are not aggregated here; only the
            // classification path accumulates. Known gap, kept as-is.
            if self.model_type == ModelType::ImageClassification {
                let m = update.metrics;
                scores.push((update.client_id.clone(), m.accuracy, m.f1_score, m.log_loss));
                let weight = update.num_examples as f64;
                totals.accuracy += m.accuracy * weight;
                totals.f1_score += m.f1_score * weight;
                totals.log_loss += m.log_loss * weight;
                total_examples += update.num_examples;
            }
        }

        let aggregated = if total_examples > 0 {
            let n = total_examples as f64;
            Some(MetricRecord {
                accuracy: totals.accuracy / n,
                f1_score: totals.f1_score / n,
                log_loss: totals.log_loss / n,
            })
        } else {
            None
        };

        let groups = labels
            .filter(|labels| !labels.is_empty())
            .map(|labels| self.group_metrics(results, labels));

        self.persist_scores(round, &mut scores)?;
        self.persist_summary(round, aggregated, groups.as_deref())?;

        let summary = RoundMetricSummary {
            round,
            aggregated,
            groups,
        };
        debug!(round, ?aggregated, "evaluation round aggregated");
        Ok((aggregated.map(|m| m.accuracy), summary))
    }

    /// Per-cluster weighted averages.
    ///
    /// Cluster resolution is positional: `labels[cid % labels.len()]`,
    /// preserved from the original deployment. Non-numeric ids fall back
    /// to their result index.
    fn group_metrics(&self, results: &[ClientUpdate], labels: &[usize]) -> Vec<MetricRecord> {
        let mut sums = vec![MetricRecord::default(); self.num_clusters];
        let mut counts = vec![0u64; self.num_clusters];

        for (index, update) in results.iter().enumerate() {
            let cid = numeric_cid(&update.client_id).unwrap_or(index as u64);
            let cluster = labels[cid as usize % labels.len()];
            if cluster >= self.num_clusters {
                continue;
            }
            let weight = update.num_examples as f64;
            sums[cluster].accuracy += update.metrics.accuracy * weight;
            sums[cluster].f1_score += update.metrics.f1_score * weight;
            sums[cluster].log_loss += update.metrics.log_loss * weight;
            counts[cluster] += update.num_examples;
        }

        sums.iter()
            .zip(counts.iter())
            .map(|(sum, &count)| {
                if count == 0 {
                    MetricRecord::default()
                } else {
                    let n = count as f64;
                    MetricRecord {
                        accuracy: sum.accuracy / n,
                        f1_score: sum.f1_score / n,
                        log_loss: sum.log_loss / n,
                    }
                }
            })
            .collect()
    }

    fn persist_scores(
        &self,
        round: u64,
        scores: &mut [(ClientId, f64, f64, f64)],
    ) -> Result<(), CoordinatorError> {
        scores.sort_by_key(|(id, _, _, _)| numeric_cid(id).unwrap_or(u64::MAX));
        let timestamp = storage::log_timestamp();

        for (path, pick) in [
            (&self.accuracy_path, 1usize),
            (&self.f1_path, 2),
            (&self.logloss_path, 3),
        ] {
            let mut block = format!("Time: {timestamp} - Round {round}\n");
            for (id, accuracy, f1, logloss) in scores.iter() {
                let value = match pick {
                    1 => accuracy,
                    2 => f1,
                    _ => logloss,
                };
                block.push_str(&format!("{id} {value}\n"));
            }
            storage::upsert_round_block(path, round, &block)?;
        }
        Ok(())
    }

    fn persist_summary(
        &self,
        round: u64,
        aggregated: Option<MetricRecord>,
        groups: Option<&[MetricRecord]>,
    ) -> Result<(), CoordinatorError> {
        let mut block = format!("Time: {} - Round {round}\n", storage::log_timestamp());
        match groups {
            Some(groups) => {
                for (index, record) in groups.iter().enumerate() {
                    block.push_str(&format!(
                        "Group-{}: Accuracy: {:.4}, F1 Score: {:.4}, Log Loss: {:.4}\n",
                        index + 1,
                        record.accuracy,
                        record.f1_score,
                        record.log_loss
                    ));
                }
            }
            None => {
                if let Some(record) = aggregated {
                    block.push_str(&format!(
                        "Aggregated Metrics: Accuracy: {:.4}, F1 Score: {:.4}, Log Loss: {:.4}\n",
                        record.accuracy, record.f1_score, record.log_loss
                    ));
                }
            }
        }
        block.push('\n');
        storage::upsert_round_block(&self.evaluation_path, round, &block)?;
        Ok(())
    }

    /// Re-derives the best cluster for a round from the persisted
    /// evaluation log.
    ///
    /// Returns the 0-based cluster label with the greatest value of the
    /// configured selection metric, plus that value. Fails with
    /// `NoMetricsForRound` when the round's block is absent or contains
    /// no parseable group line.
    pub fn select_best_cluster(&self, round: u64) -> Result<(usize, f64), CoordinatorError> {
        let no_metrics = || CoordinatorError::NoMetricsForRound {
            round,
            path: self.evaluation_path.clone(),
        };
        let text = match fs::read_to_string(&self.evaluation_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(no_metrics()),
            Err(err) => return Err(err.into()),
        };

        let mut in_round = false;
        let mut best: Option<(usize, f64)> = None;
        for line in text.lines() {
            if let Some(r) = storage::header_round(line) {
                in_round = r == round;
                continue;
            }
            if !in_round {
                continue;
            }
            if line.trim().is_empty() {
                break;
            }
            let Some((group, record)) = parse_group_line(line) else {
                continue;
            };
            let value = record.get(self.selection_metric);
            if best.map(|(_, v)| value > v).unwrap_or(true) {
                best = Some((group - 1, value));
            }
        }

        let (cluster, value) = best.ok_or_else(no_metrics)?;
        info!(
            round,
            cluster,
            metric = %self.selection_metric,
            value,
            "best cluster selected"
        );
        Ok((cluster, value))
    }
}

/// Parses a `Group-<k>: Accuracy: <v>, F1 Score: <v>, Log Loss: <v>`
/// line. Returns the 1-based group index and the record.
fn parse_group_line(line: &str) -> Option<(usize, MetricRecord)> {
    let rest = line.trim().strip_prefix("Group-")?;
    let (group, metrics) = rest.split_once(':')?;
    let group: usize = group.trim().parse().ok()?;
    if group == 0 {
        return None;
    }
    Some((
        group,
        MetricRecord {
            accuracy: parse_metric_value(metrics, "Accuracy")?,
            f1_score: parse_metric_value(metrics, "F1 Score")?,
            log_loss: parse_metric_value(metrics, "Log Loss")?,
        },
    ))
}

fn parse_metric_value(text: &str, name: &str) -> Option<f64> {
    let start = text.find(name)? + name.len();
    let rest = text[start..].trim_start().strip_prefix(':')?;
    let value = rest.split(',').next()?.trim();
    value.parse().ok()
}

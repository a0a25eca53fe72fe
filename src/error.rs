//! Error types for the coordinator core
//!
//! The three fatal variants (`UnsupportedModelType`,
//! `UninitializedClusterState`, `NoMetricsForRound`) are operator or
//! programmer errors and are surfaced immediately, never retried.
//! Degraded paths such as empty result sets or unmapped clients are not
//! errors; callers receive empty/fallback values instead.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Unknown model kind requested at construction, selection, or detection.
    #[error("Unsupported model type: {model_type}")]
    UnsupportedModelType {
        /// The model-type string that failed to resolve
        model_type: String,
    },

    /// A non-clustering round was reached before any clustering round ran.
    #[error("Cluster state not initialized: no clustering round has run yet")]
    UninitializedClusterState,

    /// Best-cluster selection found no persisted metrics block for the round.
    #[error("No metrics found for round {round} in {path}")]
    NoMetricsForRound {
        /// Round whose block is missing
        round: u64,
        /// Evaluation log that was searched
        path: PathBuf,
    },

    /// A selected cluster has no aggregated model to promote.
    #[error("No aggregated model available for cluster {cluster}")]
    ClusterModelUnavailable {
        /// Cluster label without a model
        cluster: usize,
    },

    /// Configuration errors (bad key=value overrides, invalid ranges).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem errors from the persistence layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors from persisted records.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_model_type_display() {
        let err = CoordinatorError::UnsupportedModelType {
            model_type: "Speech Recognition".to_string(),
        };
        assert!(err.to_string().contains("Speech Recognition"));
    }

    #[test]
    fn test_no_metrics_display() {
        let err = CoordinatorError::NoMetricsForRound {
            round: 7,
            path: PathBuf::from("/tmp/evaluation_loss.txt"),
        };
        assert!(err.to_string().contains("round 7"));
        assert!(err.to_string().contains("evaluation_loss.txt"));
    }
}

//! Core data types exchanged with client-side collaborators

use serde::{Deserialize, Serialize};

use crate::model::ParameterSet;

/// Stable client identifier, convertible to an integer index where the
/// deployment assigns numeric ids.
pub type ClientId = String;

/// Evaluation metrics reported by a client for one round.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClientMetrics {
    /// Classification accuracy on the client's evaluation split
    pub accuracy: f64,
    /// Macro F1 score
    pub f1_score: f64,
    /// Log loss
    pub log_loss: f64,
}

/// One client's contribution to a round: updated parameters plus the
/// metrics and sample count used for importance weighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUpdate {
    /// Submitting client
    pub client_id: ClientId,
    /// Updated model parameters in declaration order
    pub parameters: ParameterSet,
    /// Number of local examples behind this update
    pub num_examples: u64,
    /// Evaluation metrics (zeroed on fit-only rounds)
    pub metrics: ClientMetrics,
}

/// Parses a client id as an integer index, if it is numeric.
pub fn numeric_cid(id: &str) -> Option<u64> {
    id.parse().ok()
}

/// Sorts client ids numerically when every id parses as an integer,
/// falling back to lexical order otherwise.
pub fn sort_client_ids(ids: &mut [ClientId]) {
    if ids.iter().all(|id| numeric_cid(id).is_some()) {
        ids.sort_by_key(|id| numeric_cid(id).unwrap_or(u64::MAX));
    } else {
        ids.sort();
    }
}

//! Potential-poisoned-client detection
//!
//! A heuristic audit step, not an enforcement mechanism: each client's
//! final layer is compared against the promoted best-cluster model by
//! cosine similarity, the least similar client is flagged, and every
//! finding is appended to an audit log. Flagged clients are never
//! excluded from later rounds.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::model::{cosine_similarity, ModelType, ParameterSet};
use crate::storage::{self, ResultsDir};
use crate::types::{ClientId, ClientUpdate};

/// One round's detection outcome.
#[derive(Debug, Clone)]
pub struct PoisonReport {
    /// Round the detection ran in
    pub round: u64,
    /// Client with the lowest similarity to the best model
    pub flagged_client_id: ClientId,
    /// Final-layer cosine similarity per client
    pub per_client_similarity: BTreeMap<ClientId, f64>,
}

/// Flags the client whose output layer diverges most from the
/// best-cluster model.
#[derive(Debug)]
pub struct PoisonDetector {
    model_type: ModelType,
    best_model_path: PathBuf,
    audit_path: PathBuf,
}

impl PoisonDetector {
    /// Creates a detector reading and writing inside `results`.
    pub fn new(model_type: ModelType, results: &ResultsDir) -> Self {
        Self {
            model_type,
            best_model_path: results.file(storage::BEST_CLUSTER_MODEL),
            audit_path: results.file(storage::POISONED_CLIENT_DETECTION),
        }
    }

    /// Runs detection for one round's fit results.
    ///
    /// Only supported for the classification model; anomaly detection
    /// has no comparable output layer and is rejected. Returns `None`
    /// when there are no results or no persisted best model yet.
    pub fn detect(
        &self,
        round: u64,
        results: &[ClientUpdate],
    ) -> Result<Option<PoisonReport>, CoordinatorError> {
        if self.model_type != ModelType::ImageClassification {
            return Err(CoordinatorError::UnsupportedModelType {
                model_type: self.model_type.to_string(),
            });
        }
        if results.is_empty() {
            return Ok(None);
        }

        let best_model = match storage::load_parameter_set(&self.best_model_path) {
            Ok(model) => model,
            Err(CoordinatorError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(round, "no best-cluster model yet, skipping detection");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let reference = final_layer(&best_model);

        let mut per_client_similarity = BTreeMap::new();
        let mut flagged: Option<(&ClientId, f64)> = None;
        for update in results {
            let layer = final_layer(&update.parameters);
            let similarity = cosine_similarity(&reference, &layer) as f64;
            per_client_similarity.insert(update.client_id.clone(), similarity);
            match flagged {
                Some((_, lowest)) if similarity >= lowest => {}
                _ => flagged = Some((&update.client_id, similarity)),
            }
        }

        let (flagged_client_id, lowest) = match flagged {
            Some((id, similarity)) => (id.clone(), similarity),
            None => return Ok(None),
        };
        info!(
            round,
            client_id = %flagged_client_id,
            similarity = lowest,
            "potential poisoned client"
        );

        let report = PoisonReport {
            round,
            flagged_client_id,
            per_client_similarity,
        };
        self.persist(&report)?;
        Ok(Some(report))
    }

    fn persist(&self, report: &PoisonReport) -> Result<(), CoordinatorError> {
        let scores: Vec<String> = report
            .per_client_similarity
            .iter()
            .map(|(client_id, similarity)| format!("{client_id}: {similarity:.6}"))
            .collect();
        let block = format!(
            "Round {} - Potential Poisoned Client Detection\n\
             Potential Poisoned Client: Client-{}\n\
             Similarity Scores: {{{}}}\n\n",
            report.round,
            report.flagged_client_id,
            scores.join(", ")
        );
        storage::append_block(&self.audit_path, &block)?;
        Ok(())
    }
}

/// Flattened final tensor of a parameter set.
fn final_layer(parameters: &ParameterSet) -> Vec<f32> {
    parameters
        .last_tensor()
        .map(|tensor| tensor.data.clone())
        .unwrap_or_default()
}

//! Round-persistent cluster membership
//!
//! Owns the client-to-cluster map and the clustering cadence. The map
//! is always initialised (possibly empty); reaching a non-clustering
//! round before any clustering round has run is a fatal
//! `UninitializedClusterState`.
//!
//! Note the index-based fallback semantics, preserved from the original
//! deployment: labels are resolved by result position when a client is
//! missing from the map, and on clustering rounds the persisted map is
//! keyed by the *sorted* client-id list with labels taken by position.
//! This is fragile if client order changes between rounds, but it is
//! the documented behavior.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::CoordinatorError;
use crate::storage::{self, ResultsDir};
use crate::types::{sort_client_ids, ClientId};

/// Persisted per-round assignment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundAssignmentRecord {
    /// Participating clients, sorted
    pub client_ids: Vec<ClientId>,
    /// Cluster label per client, parallel to `client_ids`
    pub cluster_labels: Vec<usize>,
}

/// Stable mapping from client identity to cluster label across rounds.
#[derive(Debug)]
pub struct ClusterAssignmentStore {
    clustering_frequency: u64,
    map: BTreeMap<ClientId, usize>,
    labels: Vec<usize>,
    has_clustered: bool,
    json_path: PathBuf,
    txt_path: PathBuf,
}

impl ClusterAssignmentStore {
    /// Creates an empty store persisting into `results`.
    pub fn new(clustering_frequency: u64, results: &ResultsDir) -> Self {
        Self {
            clustering_frequency,
            map: BTreeMap::new(),
            labels: Vec::new(),
            has_clustered: false,
            json_path: results.file(storage::CLUSTER_ASSIGNMENTS_JSON),
            txt_path: results.file(storage::CLUSTER_ASSIGNMENTS_TXT),
        }
    }

    /// Whether this round recomputes cluster membership.
    pub fn is_clustering_round(&self, round: u64) -> bool {
        round == 1 || round % self.clustering_frequency == 0
    }

    /// Cluster label for a client, if it is in the map.
    pub fn lookup(&self, client_id: &str) -> Option<usize> {
        self.map.get(client_id).copied()
    }

    /// The most recent clustering round's labels, in result order.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Whether any clustering round has ever run.
    pub fn has_clustered(&self) -> bool {
        self.has_clustered
    }

    /// Resolves the per-result cluster labels for a round.
    ///
    /// On clustering rounds `fresh` carries the newly computed labels;
    /// they become the stored labels and seed the map keyed by result
    /// index. On other rounds the stored labels are reused, the map is
    /// extended by position for result indices it does not cover, and
    /// each result's label comes from the map with a positional
    /// fallback.
    pub fn resolve_round_labels(
        &mut self,
        round: u64,
        num_results: usize,
        fresh: Option<Vec<usize>>,
    ) -> Result<Vec<usize>, CoordinatorError> {
        if self.is_clustering_round(round) {
            let labels = fresh.unwrap_or_default();
            info!(round, clusters = ?labels, "clustering round: new labels");
            self.map = labels
                .iter()
                .enumerate()
                .map(|(i, &label)| (i.to_string(), label))
                .collect();
            self.labels = labels.clone();
            self.has_clustered = true;
            return Ok(labels);
        }

        if !self.has_clustered || self.labels.is_empty() {
            return Err(CoordinatorError::UninitializedClusterState);
        }

        if self.map.len() < num_results {
            for i in 0..num_results {
                let key = i.to_string();
                self.map
                    .entry(key)
                    .or_insert(self.labels[i % self.labels.len()]);
            }
        }

        let labels = (0..num_results)
            .map(|i| {
                self.map
                    .get(&i.to_string())
                    .copied()
                    .unwrap_or(self.labels[i % self.labels.len()])
            })
            .collect();
        debug!(round, "reusing cluster labels");
        Ok(labels)
    }

    /// Records and persists the round's assignments.
    ///
    /// On clustering rounds the map is rebuilt keyed by the sorted
    /// client-id list, each id taking the label at its sorted position.
    /// Both persisted formats are upserts keyed by round. Fails with
    /// `UninitializedClusterState` when no labels have been resolved
    /// yet.
    pub fn record_assignments(
        &mut self,
        round: u64,
        client_ids: &[ClientId],
    ) -> Result<(), CoordinatorError> {
        if self.labels.is_empty() {
            return Err(CoordinatorError::UninitializedClusterState);
        }
        let mut sorted = client_ids.to_vec();
        sort_client_ids(&mut sorted);

        if self.is_clustering_round(round) {
            self.map = sorted
                .iter()
                .enumerate()
                .map(|(idx, id)| (id.clone(), self.labels[idx % self.labels.len()]))
                .collect();
        }

        let labels: Vec<usize> = sorted
            .iter()
            .enumerate()
            .map(|(idx, id)| {
                self.lookup(id)
                    .unwrap_or_else(|| self.labels[idx % self.labels.len()])
            })
            .collect();

        self.persist_json(round, &sorted, &labels)?;
        self.persist_txt(round, &sorted, &labels)?;
        Ok(())
    }

    fn persist_json(
        &self,
        round: u64,
        client_ids: &[ClientId],
        labels: &[usize],
    ) -> Result<(), CoordinatorError> {
        let mut records: BTreeMap<u64, RoundAssignmentRecord> = match fs::read_to_string(
            &self.json_path,
        ) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        records.insert(
            round,
            RoundAssignmentRecord {
                client_ids: client_ids.to_vec(),
                cluster_labels: labels.to_vec(),
            },
        );
        fs::write(&self.json_path, serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }

    fn persist_txt(
        &self,
        round: u64,
        client_ids: &[ClientId],
        labels: &[usize],
    ) -> Result<(), CoordinatorError> {
        let mut block = format!("Server Round {round}:\n");
        for (id, label) in client_ids.iter().zip(labels.iter()) {
            block.push_str(&format!("Client ID: {id}, Cluster: {label}\n"));
        }
        block.push('\n');
        storage::upsert_round_block(&self.txt_path, round, &block)?;
        Ok(())
    }

    /// Loads the persisted record for a round, if present.
    pub fn load_round(&self, round: u64) -> Result<Option<RoundAssignmentRecord>, CoordinatorError> {
        let records: BTreeMap<u64, RoundAssignmentRecord> =
            match fs::read_to_string(&self.json_path) {
                Ok(text) => serde_json::from_str(&text)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };
        Ok(records.get(&round).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(frequency: u64) -> (ClusterAssignmentStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let results = ResultsDir::at(dir.path().join("run")).unwrap();
        (ClusterAssignmentStore::new(frequency, &results), dir)
    }

    #[test]
    fn test_clustering_cadence() {
        let (s, _dir) = store(3);
        assert!(s.is_clustering_round(1));
        assert!(!s.is_clustering_round(2));
        assert!(s.is_clustering_round(3));
        assert!(!s.is_clustering_round(4));
        assert!(s.is_clustering_round(6));
    }

    #[test]
    fn test_record_before_any_clustering_fails() {
        let (mut s, _dir) = store(1);
        let err = s
            .record_assignments(1, &["0".into(), "1".into()])
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UninitializedClusterState));
    }

    #[test]
    fn test_uninitialized_cluster_state() {
        let (mut s, _dir) = store(5);
        let err = s.resolve_round_labels(2, 3, None).unwrap_err();
        assert!(matches!(err, CoordinatorError::UninitializedClusterState));
    }

    #[test]
    fn test_labels_stable_between_clustering_rounds() {
        let (mut s, _dir) = store(10);
        let ids: Vec<ClientId> = (0..4).map(|i| i.to_string()).collect();

        let round1 = s
            .resolve_round_labels(1, 4, Some(vec![0, 1, 1, 2]))
            .unwrap();
        s.record_assignments(1, &ids).unwrap();

        let round2 = s.resolve_round_labels(2, 4, None).unwrap();
        assert_eq!(round1, round2);
        assert_eq!(s.lookup("2"), Some(1));
    }

    #[test]
    fn test_extension_by_position() {
        let (mut s, _dir) = store(10);
        s.resolve_round_labels(1, 3, Some(vec![2, 0, 1])).unwrap();
        s.record_assignments(1, &["0".into(), "1".into(), "2".into()])
            .unwrap();

        // A fourth client appears on a non-clustering round; it takes the
        // label at its index position, wrapped into the stored labels.
        let labels = s.resolve_round_labels(2, 4, None).unwrap();
        assert_eq!(labels, vec![2, 0, 1, 2]);
        assert_eq!(s.lookup("3"), Some(2));
    }

    #[test]
    fn test_idempotent_persistence() {
        let (mut s, _dir) = store(1);
        let ids: Vec<ClientId> = vec!["0".into(), "1".into()];

        s.resolve_round_labels(1, 2, Some(vec![0, 1])).unwrap();
        s.record_assignments(1, &ids).unwrap();

        // Re-issue the same round with different labels.
        s.resolve_round_labels(1, 2, Some(vec![1, 0])).unwrap();
        s.record_assignments(1, &ids).unwrap();

        let record = s.load_round(1).unwrap().unwrap();
        assert_eq!(record.cluster_labels, vec![1, 0]);

        let text = fs::read_to_string(&s.txt_path).unwrap();
        assert_eq!(text.matches("Server Round 1:").count(), 1);
        assert!(text.contains("Client ID: 0, Cluster: 1"));
    }

    #[test]
    fn test_map_keyed_by_sorted_ids() {
        let (mut s, _dir) = store(1);
        s.resolve_round_labels(1, 3, Some(vec![0, 1, 2])).unwrap();
        // Unsorted participation order; labels attach by sorted position.
        s.record_assignments(1, &["10".into(), "2".into(), "1".into()])
            .unwrap();
        assert_eq!(s.lookup("1"), Some(0));
        assert_eq!(s.lookup("2"), Some(1));
        assert_eq!(s.lookup("10"), Some(2));
    }
}

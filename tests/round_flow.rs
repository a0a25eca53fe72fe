//! End-to-end round flow over a temporary results directory.

use std::fs;

use tempfile::tempdir;

use fedcluster::storage::{self, ResultsDir};
use fedcluster::{
    ClientMetrics, ClientUpdate, CoordinatorConfig, ParameterSet, RoundOrchestrator, Tensor,
};

fn update(id: &str, values: Vec<f32>, accuracy: f64) -> ClientUpdate {
    ClientUpdate {
        client_id: id.to_string(),
        parameters: ParameterSet::new(vec![Tensor::new(vec![values.len()], values)]),
        num_examples: 50,
        metrics: ClientMetrics {
            accuracy,
            f1_score: accuracy - 0.05,
            log_loss: 1.0 - accuracy,
        },
    }
}

/// Two natural client groups: 0 and 1 push in one direction with high
/// accuracy, 2 and 3 in another with low accuracy.
fn fit_results() -> Vec<ClientUpdate> {
    vec![
        update("0", vec![1.0, 0.1], 0.9),
        update("1", vec![0.9, 0.0], 0.9),
        update("2", vec![0.0, 1.0], 0.6),
        update("3", vec![0.1, 0.9], 0.6),
    ]
}

#[test]
fn dynamic_grouping_two_rounds() {
    let dir = tempdir().unwrap();
    let results_dir = ResultsDir::at(dir.path().join("run")).unwrap();
    let config = CoordinatorConfig::default()
        .with_dynamic_grouping(true)
        .with_num_clusters(2)
        .with_clustering_frequency(3);
    let mut orchestrator = RoundOrchestrator::new(config, results_dir.clone())
        .unwrap()
        .with_seed(42);

    let clients: Vec<String> = (0..4).map(|i| i.to_string()).collect();

    // Round 1: everyone trains on the untrained global model.
    let instructions = orchestrator.configure_fit(1, &clients);
    assert_eq!(instructions.len(), 4);
    let initial = orchestrator.initialize_parameters();
    for instruction in &instructions {
        assert_eq!(instruction.parameters, initial);
    }

    let (global, clusters) = orchestrator.aggregate_fit(1, &fit_results()).unwrap();
    assert!(global.is_some());
    assert!(!clusters.is_empty());

    let evaluators = orchestrator.configure_evaluate(1, &clients);
    assert_eq!(evaluators.len(), 4);
    let weighted = orchestrator.aggregate_evaluate(1, &fit_results()).unwrap();
    // Equal sample counts: (0.9 + 0.9 + 0.6 + 0.6) / 4
    assert!((weighted.unwrap() - 0.75).abs() < 1e-9);

    // The best cluster's model is promoted to a loadable artifact.
    let best_path = results_dir.file(storage::BEST_CLUSTER_MODEL);
    let best = storage::load_parameter_set(&best_path).unwrap();
    assert_eq!(best.tensors.len(), 1);

    // Round 2 reuses the stored assignments (no re-clustering); every
    // mapped client now trains on its cluster model.
    let instructions = orchestrator.configure_fit(2, &clients);
    assert_eq!(instructions.len(), 4);
    let cluster_models: Vec<&ParameterSet> = orchestrator.cluster_models().values().collect();
    for instruction in &instructions {
        assert!(
            cluster_models.contains(&&instruction.parameters),
            "client {} did not receive a cluster model",
            instruction.client_id
        );
    }

    let (global, _) = orchestrator.aggregate_fit(2, &fit_results()).unwrap();
    assert!(global.is_some());
    orchestrator.configure_evaluate(2, &clients);
    let weighted = orchestrator.aggregate_evaluate(2, &fit_results()).unwrap();
    assert!(weighted.is_some());

    // Persisted artifacts for both rounds.
    let assignments = fs::read_to_string(results_dir.file(storage::CLUSTER_ASSIGNMENTS_TXT)).unwrap();
    assert!(assignments.contains("Server Round 1:"));
    assert!(assignments.contains("Server Round 2:"));
    let evaluation = fs::read_to_string(results_dir.file(storage::EVALUATION_LOSS)).unwrap();
    assert!(evaluation.contains("Group-1:"));
    let consumption = fs::read_to_string(results_dir.file(storage::RESOURCE_CONSUMPTION)).unwrap();
    assert!(consumption.lines().count() >= 4);
    assert!(results_dir.file(storage::ACCURACY_SCORES).exists());
    assert!(results_dir.file(storage::F1_SCORES).exists());
    assert!(results_dir.file(storage::LOGLOSS_SCORES).exists());
    assert!(results_dir.file(storage::CLUSTER_ASSIGNMENTS_JSON).exists());
}

#[test]
fn poison_detection_after_promotion() {
    let dir = tempdir().unwrap();
    let results_dir = ResultsDir::at(dir.path().join("run")).unwrap();
    let config = CoordinatorConfig::default()
        .with_dynamic_grouping(true)
        .with_num_clusters(2);
    let mut orchestrator = RoundOrchestrator::new(config, results_dir.clone())
        .unwrap()
        .with_seed(42);

    let clients: Vec<String> = (0..4).map(|i| i.to_string()).collect();
    orchestrator.configure_fit(1, &clients);
    orchestrator.aggregate_fit(1, &fit_results()).unwrap();
    orchestrator.configure_evaluate(1, &clients);
    orchestrator.aggregate_evaluate(1, &fit_results()).unwrap();

    // One client aligned with the promoted model, one pushing the
    // opposite way.
    let best = storage::load_parameter_set(&results_dir.file(storage::BEST_CLUSTER_MODEL)).unwrap();
    let aligned = best.tensors[0].data.clone();
    let inverted: Vec<f32> = aligned.iter().map(|v| -v).collect();
    let report = orchestrator
        .detect_potential_poisoned_client(
            1,
            &[update("0", aligned, 0.9), update("1", inverted, 0.9)],
        )
        .unwrap()
        .unwrap();
    assert_eq!(report.flagged_client_id, "1");

    let audit = fs::read_to_string(results_dir.file(storage::POISONED_CLIENT_DETECTION)).unwrap();
    assert!(audit.contains("Potential Poisoned Client: Client-1"));
}

#[test]
fn plain_mode_round() {
    let dir = tempdir().unwrap();
    let results_dir = ResultsDir::at(dir.path().join("run")).unwrap();
    let mut orchestrator = RoundOrchestrator::new(CoordinatorConfig::default(), results_dir.clone())
        .unwrap()
        .with_seed(42);

    let clients: Vec<String> = (0..4).map(|i| i.to_string()).collect();
    orchestrator.configure_fit(1, &clients);
    let (global, clusters) = orchestrator.aggregate_fit(1, &fit_results()).unwrap();
    // Plain unweighted mean of the four updates.
    let tensor = &global.unwrap().tensors[0];
    assert!((tensor.data[0] - 0.5).abs() < 1e-6);
    assert!((tensor.data[1] - 0.5).abs() < 1e-6);
    assert!(clusters.is_empty());

    orchestrator.configure_evaluate(1, &clients);
    let weighted = orchestrator.aggregate_evaluate(1, &fit_results()).unwrap();
    assert!((weighted.unwrap() - 0.75).abs() < 1e-9);

    // Plain mode writes the aggregated log, not the grouped one.
    let aggregated =
        fs::read_to_string(results_dir.file(storage::AGGREGATED_EVALUATION_LOSS)).unwrap();
    assert!(aggregated.contains("Aggregated Metrics: Accuracy: 0.7500"));
    assert!(!results_dir.file(storage::EVALUATION_LOSS).exists());
}

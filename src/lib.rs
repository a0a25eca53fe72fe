//! Federated learning coordinator core
//!
//! Implements the server-side round logic for a clustered federated
//! learning deployment: clients are grouped by the cosine similarity of
//! their model updates, each cluster trains its own aggregated model,
//! and after every evaluate round the best-performing cluster's model
//! is promoted to a persisted artifact. A similarity-based audit step
//! flags potentially poisoned clients.
//!
//! The crate is transport-agnostic. Callers drive the
//! [`RoundOrchestrator`] with the available client population and the
//! updates those clients return; everything the coordinator decides or
//! measures is persisted as round-keyed text and JSON logs in a
//! per-run results directory.
//!
//! ```no_run
//! use fedcluster::{CoordinatorConfig, RoundOrchestrator};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), fedcluster::CoordinatorError> {
//! let config = CoordinatorConfig::default().with_dynamic_grouping(true);
//! let mut orchestrator = RoundOrchestrator::create(config, Path::new("results"))?;
//! let clients: Vec<String> = (0..10).map(|i| i.to_string()).collect();
//! let instructions = orchestrator.configure_fit(1, &clients);
//! # let _ = instructions;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod assignment;
pub mod clustering;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod poison;
pub mod resources;
pub mod storage;
pub mod types;

pub use aggregate::{ClusterAggregate, ClusterAggregator};
pub use assignment::{ClusterAssignmentStore, RoundAssignmentRecord};
pub use clustering::SimilarityClusterer;
pub use config::CoordinatorConfig;
pub use error::CoordinatorError;
pub use evaluation::{MetricsEvaluator, RoundMetricSummary, SelectionMetric};
pub use model::{ModelType, ParameterSet, Tensor};
pub use orchestrator::{
    EvaluateInstruction, FitInstruction, RoundOrchestrator, RoundPhase,
};
pub use poison::{PoisonDetector, PoisonReport};
pub use resources::{ResourceLog, ResourceSample, ResourceSampler, StaticResourceSampler};
pub use storage::ResultsDir;
pub use types::{ClientId, ClientMetrics, ClientUpdate};

//! Persistence layout and round-keyed log writing
//!
//! All artifacts for one coordinator run live in a single results
//! directory. The text logs are organised in round-keyed blocks; writes
//! are upserts so re-issuing a round's aggregate step replaces that
//! round's records instead of duplicating them.

use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::model::ModelType;

/// Round-keyed assignment store (structured, JSON).
pub const CLUSTER_ASSIGNMENTS_JSON: &str = "cluster_assignments.json";
/// Flat text log of assignments.
pub const CLUSTER_ASSIGNMENTS_TXT: &str = "cluster_assignments.txt";
/// Aggregated per-round resource consumption.
pub const RESOURCE_CONSUMPTION: &str = "resource_consumption.txt";
/// Per-client hardware samples.
pub const HARDWARE_RESOURCES: &str = "hardware_resources.ncol";
/// Per-client accuracy scores.
pub const ACCURACY_SCORES: &str = "accuracy_scores.ncol";
/// Per-client F1 scores.
pub const F1_SCORES: &str = "F1_scores.ncol";
/// Per-client log-loss scores.
pub const LOGLOSS_SCORES: &str = "LogLoss_scores.ncol";
/// Evaluation summary log, dynamic grouping mode.
pub const EVALUATION_LOSS: &str = "evaluation_loss.txt";
/// Evaluation summary log, plain global mode.
pub const AGGREGATED_EVALUATION_LOSS: &str = "aggregated_evaluation_loss.txt";
/// Persisted best-cluster model artifact.
pub const BEST_CLUSTER_MODEL: &str = "best_cluster_model.json";
/// Append-only poison detection audit log.
pub const POISONED_CLIENT_DETECTION: &str = "poisoned_client_detection.txt";

/// Directory holding every persisted artifact of one coordinator run.
#[derive(Debug, Clone)]
pub struct ResultsDir {
    root: PathBuf,
}

impl ResultsDir {
    /// Creates `base/<ModelType>_<timestamp>/`.
    pub fn create(base: &Path, model_type: ModelType) -> std::io::Result<Self> {
        let root = base.join(format!(
            "{}_{}",
            model_type,
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Uses an explicit directory, creating it if needed.
    pub fn at(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = path.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The results directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an artifact inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Local wall-clock timestamp for log headers.
pub fn log_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Saves a parameter set as a JSON artifact, overwriting any previous
/// contents.
pub fn save_parameter_set(
    path: &Path,
    parameters: &crate::model::ParameterSet,
) -> Result<(), crate::error::CoordinatorError> {
    fs::write(path, serde_json::to_string(parameters)?)?;
    Ok(())
}

/// Loads a parameter set from a JSON artifact.
pub fn load_parameter_set(
    path: &Path,
) -> Result<crate::model::ParameterSet, crate::error::CoordinatorError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Extracts the round number from a block header line.
///
/// Recognised headers: `Server Round <r>:`, `Time: <ts> - Round <r>`,
/// and bare `Round <r>`. Returns `None` for any other line.
pub(crate) fn header_round(line: &str) -> Option<u64> {
    let rest = if let Some(rest) = line.strip_prefix("Server Round ") {
        rest
    } else if let Some(pos) = line.find(" - Round ") {
        &line[pos + " - Round ".len()..]
    } else if let Some(rest) = line.strip_prefix("Round ") {
        rest
    } else {
        return None;
    };
    let digits: &str = rest
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    digits.parse().ok()
}

/// Inserts or replaces the block for `round` in a round-keyed log.
///
/// `block` must contain the header line and any terminator the file
/// grammar requires (e.g. the trailing blank line of evaluation blocks).
pub fn upsert_round_block(path: &Path, round: u64, block: &str) -> std::io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };

    let mut output = String::new();
    let mut current_round: Option<u64> = None;
    for line in existing.lines() {
        if let Some(r) = header_round(line) {
            current_round = Some(r);
        }
        if current_round != Some(round) {
            output.push_str(line);
            output.push('\n');
        }
    }
    output.push_str(block);

    fs::write(path, output)
}

/// Inserts or replaces the single data line for `round` in a
/// comma-separated per-round log. Header lines (first field not an
/// integer) are preserved in place.
pub fn upsert_round_line(path: &Path, round: u64, line: &str) -> std::io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };

    let mut output = String::new();
    for existing_line in existing.lines() {
        let first_field = existing_line.split(',').next().unwrap_or("").trim();
        if first_field.parse::<u64>() == Ok(round) {
            continue;
        }
        output.push_str(existing_line);
        output.push('\n');
    }
    output.push_str(line);
    if !line.ends_with('\n') {
        output.push('\n');
    }

    fs::write(path, output)
}

/// Appends a block to an append-only log.
pub fn append_block(path: &Path, block: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(block.as_bytes())
}

//! Per-round resource consumption logging
//!
//! Hardware samples come from an external collaborator behind the
//! [`ResourceSampler`] trait; the coordinator only aggregates and logs
//! them. Both logs are round-keyed upserts.

use std::fs;
use std::path::PathBuf;

use crate::error::CoordinatorError;
use crate::storage::{self, ResultsDir};
use crate::types::ClientId;

/// One client's resource sample for a round.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    /// CPU usage percentage
    pub cpu_percent: f64,
    /// GPU usage percentage
    pub gpu_percent: f64,
    /// Memory usage percentage
    pub memory_percent: f64,
    /// Network bytes sent, in MB
    pub net_sent_mb: f64,
    /// Network bytes received, in MB
    pub net_recv_mb: f64,
}

/// Source of per-client hardware samples.
pub trait ResourceSampler {
    /// Samples the resource usage attributed to one client.
    fn sample(&mut self, client_id: &str) -> ResourceSample;
}

/// Sampler returning a fixed sample for every client. Default stand-in
/// when no host integration is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticResourceSampler {
    /// Sample returned for every client
    pub sample: ResourceSample,
}

impl ResourceSampler for StaticResourceSampler {
    fn sample(&mut self, _client_id: &str) -> ResourceSample {
        self.sample
    }
}

/// Writes the aggregated and per-client resource logs.
#[derive(Debug)]
pub struct ResourceLog {
    consumption_path: PathBuf,
    hardware_path: PathBuf,
}

impl ResourceLog {
    /// Creates the log files, writing the consumption header block.
    pub fn new(results: &ResultsDir) -> Result<Self, CoordinatorError> {
        let consumption_path = results.file(storage::RESOURCE_CONSUMPTION);
        let hardware_path = results.file(storage::HARDWARE_RESOURCES);
        fs::write(
            &consumption_path,
            "Resource Consumption Log\n\
             Round, AggCPU%, AggGPU%, AvgMem%, AvgNetSent(MB), AvgNetRecv(MB)\n",
        )?;
        Ok(Self {
            consumption_path,
            hardware_path,
        })
    }

    /// Records one round's samples: per-client lines plus one
    /// aggregated line.
    pub fn record_round(
        &self,
        round: u64,
        samples: &[(ClientId, ResourceSample)],
    ) -> Result<(), CoordinatorError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut block = format!("Round {round}\n");
        for (client_id, sample) in samples {
            block.push_str(&format!(
                "Client {client_id}: CPU {:.3}%, GPU {:.3}%, Memory {:.3}%, \
                 Network Sent: {:.3}MB, Network Received: {:.3}MB\n",
                sample.cpu_percent,
                sample.gpu_percent,
                sample.memory_percent,
                sample.net_sent_mb,
                sample.net_recv_mb
            ));
        }
        storage::upsert_round_block(&self.hardware_path, round, &block)?;

        let n = samples.len() as f64;
        let total_cpu: f64 = samples.iter().map(|(_, s)| s.cpu_percent).sum();
        let total_gpu: f64 = samples.iter().map(|(_, s)| s.gpu_percent).sum();
        let avg_memory: f64 = samples.iter().map(|(_, s)| s.memory_percent).sum::<f64>() / n;
        let avg_sent: f64 = samples.iter().map(|(_, s)| s.net_sent_mb).sum::<f64>() / n;
        let avg_recv: f64 = samples.iter().map(|(_, s)| s.net_recv_mb).sum::<f64>() / n;

        let line = format!(
            "{round}, {total_cpu:.3}, {total_gpu:.3}, {avg_memory:.3}, {avg_sent:.3}, {avg_recv:.3}"
        );
        storage::upsert_round_line(&self.consumption_path, round, &line)?;
        Ok(())
    }
}

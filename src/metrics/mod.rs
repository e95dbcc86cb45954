//! Metric families and the value types read from the OS metric source.

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod process;

pub use cpu::CpuData;
pub use disk::{DiskIoCounters, DiskIoData, PartitionData};
pub use memory::{MemoryData, MemoryUsage};
pub use process::{ProcessData, ProcessMetric};

use crate::error::CollectError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A category of system measurement with its own collection and reporting path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Cpu,
    Memory,
    DiskPartitions,
    DiskIo,
    TopProcessesCpu,
    TopProcessesMemory,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 6] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::DiskPartitions,
        MetricFamily::DiskIo,
        MetricFamily::TopProcessesCpu,
        MetricFamily::TopProcessesMemory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Cpu => "cpu",
            MetricFamily::Memory => "memory",
            MetricFamily::DiskPartitions => "disk_partitions",
            MetricFamily::DiskIo => "disk_io",
            MetricFamily::TopProcessesCpu => "top_processes_cpu",
            MetricFamily::TopProcessesMemory => "top_processes_memory",
        }
    }
}

impl std::fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricFamily {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricFamily::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| CollectError::UnsupportedMetric(s.to_string()))
    }
}

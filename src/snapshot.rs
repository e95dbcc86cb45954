//! The per-round snapshot record and the guarded aggregator fan-out tasks write into.

use crate::metrics::{CpuData, DiskIoData, MemoryData, MetricFamily, PartitionData, ProcessData};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Everything one collection round managed to read. A family whose task failed stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_partitions: Option<Vec<PartitionData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_io: Option<Vec<DiskIoData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_processes_cpu: Option<Vec<ProcessData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_processes_memory: Option<Vec<ProcessData>>,
}

impl Snapshot {
    pub fn has(&self, family: MetricFamily) -> bool {
        match family {
            MetricFamily::Cpu => self.cpu.is_some(),
            MetricFamily::Memory => self.memory.is_some(),
            MetricFamily::DiskPartitions => self.disk_partitions.is_some(),
            MetricFamily::DiskIo => self.disk_io.is_some(),
            MetricFamily::TopProcessesCpu => self.top_processes_cpu.is_some(),
            MetricFamily::TopProcessesMemory => self.top_processes_memory.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !MetricFamily::ALL.iter().any(|f| self.has(*f))
    }
}

/// Collects results from concurrent tasks. Each setter holds the lock only for its own write.
#[derive(Debug, Default)]
pub struct SnapshotAggregator {
    inner: Mutex<Snapshot>,
}

impl SnapshotAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_cpu(&self, cpu: CpuData) {
        self.inner.lock().await.cpu = Some(cpu);
    }

    pub async fn set_memory(&self, memory: MemoryData) {
        self.inner.lock().await.memory = Some(memory);
    }

    pub async fn set_disk_partitions(&self, partitions: Vec<PartitionData>) {
        self.inner.lock().await.disk_partitions = Some(partitions);
    }

    pub async fn set_disk_io(&self, disk_io: Vec<DiskIoData>) {
        self.inner.lock().await.disk_io = Some(disk_io);
    }

    pub async fn set_top_processes_cpu(&self, processes: Vec<ProcessData>) {
        self.inner.lock().await.top_processes_cpu = Some(processes);
    }

    pub async fn set_top_processes_memory(&self, processes: Vec<ProcessData>) {
        self.inner.lock().await.top_processes_memory = Some(processes);
    }

    /// Copy of what has been written so far
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.clone()
    }

    /// Finish aggregation. Consuming the aggregator means no writer can touch the result.
    pub fn into_snapshot(self) -> Snapshot {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn cpu(total: f64) -> CpuData {
        CpuData {
            total_percent: total,
            per_core_percent: BTreeMap::from([(0, total)]),
            core_count: 1,
        }
    }

    #[tokio::test]
    async fn concurrent_writers_all_land() {
        let aggregator = Arc::new(SnapshotAggregator::new());

        let mut handles = Vec::new();
        {
            let agg = aggregator.clone();
            handles.push(tokio::spawn(async move { agg.set_cpu(cpu(12.5)).await }));
        }
        {
            let agg = aggregator.clone();
            handles.push(tokio::spawn(async move { agg.set_disk_io(Vec::new()).await }));
        }
        {
            let agg = aggregator.clone();
            handles.push(tokio::spawn(async move {
                agg.set_top_processes_memory(Vec::new()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = Arc::try_unwrap(aggregator).unwrap().into_snapshot();
        assert_eq!(snapshot.cpu, Some(cpu(12.5)));
        assert!(snapshot.has(MetricFamily::DiskIo));
        assert!(snapshot.has(MetricFamily::TopProcessesMemory));
        assert!(!snapshot.has(MetricFamily::Memory));
        assert!(!snapshot.has(MetricFamily::DiskPartitions));
        assert!(!snapshot.is_empty());
    }

    #[tokio::test]
    async fn later_write_replaces_earlier() {
        let aggregator = SnapshotAggregator::new();
        aggregator.set_cpu(cpu(1.0)).await;
        aggregator.set_cpu(cpu(2.0)).await;
        assert_eq!(aggregator.snapshot().await.cpu, Some(cpu(2.0)));
    }

    #[test]
    fn missing_families_are_left_out_of_json() {
        let snapshot = Snapshot {
            cpu: Some(cpu(50.0)),
            ..Snapshot::default()
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["cpu"]);
        assert!(Snapshot::default().is_empty());
    }
}

//! The OS metric source seam and its /proc implementation.

use crate::error::CollectError;
use crate::metrics::cpu::CpuSample;
use crate::metrics::{
    disk, process, CpuData, DiskIoCounters, MemoryData, MetricFamily, PartitionData, ProcessData,
    ProcessMetric,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Point-in-time readings for every metric family.
///
/// Calls may suspend for a bounded time (CPU percent needs a real window), so callers
/// race them against shutdown rather than assuming they return promptly.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn read_cpu(&self) -> Result<CpuData, CollectError>;

    async fn read_memory(&self) -> Result<MemoryData, CollectError>;

    async fn read_partitions(&self) -> Result<Vec<PartitionData>, CollectError>;

    /// Cumulative counters; callers difference two reads to get a speed.
    async fn read_disk_io_counters(&self) -> Result<HashMap<String, DiskIoCounters>, CollectError>;

    /// At most `top_n` processes, sorted by the requested usage descending.
    async fn read_top_processes(
        &self,
        metric: ProcessMetric,
        top_n: usize,
    ) -> Result<Vec<ProcessData>, CollectError>;
}

/// Reads everything from /proc and statvfs
pub struct ProcfsSource {
    cpu_window: Duration,
}

impl ProcfsSource {
    pub fn new(cpu_window: Duration) -> Self {
        Self { cpu_window }
    }
}

#[async_trait]
impl MetricSource for ProcfsSource {
    async fn read_cpu(&self) -> Result<CpuData, CollectError> {
        let family = MetricFamily::Cpu;
        let first = blocking(family, CpuSample::read).await?;
        tokio::time::sleep(self.cpu_window).await;
        let second = blocking(family, CpuSample::read).await?;
        Ok(CpuData::between(&first, &second))
    }

    async fn read_memory(&self) -> Result<MemoryData, CollectError> {
        blocking(MetricFamily::Memory, MemoryData::read).await
    }

    async fn read_partitions(&self) -> Result<Vec<PartitionData>, CollectError> {
        blocking(MetricFamily::DiskPartitions, disk::read_partitions).await
    }

    async fn read_disk_io_counters(&self) -> Result<HashMap<String, DiskIoCounters>, CollectError> {
        blocking(MetricFamily::DiskIo, disk::read_io_counters).await
    }

    async fn read_top_processes(
        &self,
        metric: ProcessMetric,
        top_n: usize,
    ) -> Result<Vec<ProcessData>, CollectError> {
        let processes = blocking(metric.family(), process::read_processes).await?;
        Ok(process::select_top(processes, metric, top_n))
    }
}

/// Every /proc read and statvfs call runs on the blocking pool. statvfs on a stale
/// network mount can hang.
async fn blocking<T, F>(family: MetricFamily, f: F) -> Result<T, CollectError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| unavailable(family, e)),
        Err(e) => Err(CollectError::unavailable(family, e)),
    }
}

fn unavailable(family: MetricFamily, err: anyhow::Error) -> CollectError {
    // {:#} keeps the context chain on one line
    CollectError::unavailable(family, format!("{:#}", err))
}

#[cfg(test)]
pub mod testing {
    //! A scripted in-memory source for scheduler and fan-out tests.

    use super::*;
    use crate::metrics::MemoryUsage;
    use std::collections::{BTreeMap, HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedSource {
        cpu: Mutex<VecDeque<f64>>,
        memory: Mutex<VecDeque<f64>>,
        idle_value: f64,
        failing: Mutex<HashSet<MetricFamily>>,
        panicking: HashSet<MetricFamily>,
        latency: HashMap<MetricFamily, Duration>,
        io_reads: Mutex<VecDeque<HashMap<String, DiskIoCounters>>>,
        calls: Mutex<HashMap<MetricFamily, usize>>,
    }

    impl ScriptedSource {
        pub fn new() -> Self {
            Self::default()
        }

        /// CPU totals returned in order; once exhausted every read returns the idle value
        pub fn with_cpu(mut self, readings: &[f64]) -> Self {
            self.cpu = Mutex::new(readings.iter().copied().collect());
            self
        }

        pub fn with_memory(mut self, readings: &[f64]) -> Self {
            self.memory = Mutex::new(readings.iter().copied().collect());
            self
        }

        pub fn with_idle_value(mut self, value: f64) -> Self {
            self.idle_value = value;
            self
        }

        pub fn with_latency(mut self, family: MetricFamily, latency: Duration) -> Self {
            self.latency.insert(family, latency);
            self
        }

        pub fn with_io_reads(mut self, reads: Vec<HashMap<String, DiskIoCounters>>) -> Self {
            self.io_reads = Mutex::new(reads.into());
            self
        }

        pub fn failing(self, family: MetricFamily) -> Self {
            self.failing.lock().unwrap().insert(family);
            self
        }

        pub fn panicking(mut self, family: MetricFamily) -> Self {
            self.panicking.insert(family);
            self
        }

        pub fn recover(&self, family: MetricFamily) {
            self.failing.lock().unwrap().remove(&family);
        }

        pub fn calls(&self, family: MetricFamily) -> usize {
            self.calls.lock().unwrap().get(&family).copied().unwrap_or(0)
        }

        async fn enter(&self, family: MetricFamily) -> Result<(), CollectError> {
            *self.calls.lock().unwrap().entry(family).or_default() += 1;
            if let Some(latency) = self.latency.get(&family) {
                tokio::time::sleep(*latency).await;
            }
            if self.panicking.contains(&family) {
                panic!("scripted panic reading {}", family);
            }
            if self.failing.lock().unwrap().contains(&family) {
                return Err(CollectError::unavailable(family, "scripted failure"));
            }
            Ok(())
        }

        fn next(&self, queue: &Mutex<VecDeque<f64>>) -> f64 {
            queue.lock().unwrap().pop_front().unwrap_or(self.idle_value)
        }
    }

    fn usage(percent: f64) -> MemoryUsage {
        MemoryUsage {
            total: 1000,
            used: (percent * 10.0) as u64,
            free: 1000 - (percent * 10.0) as u64,
            used_percent: percent,
        }
    }

    #[async_trait]
    impl MetricSource for ScriptedSource {
        async fn read_cpu(&self) -> Result<CpuData, CollectError> {
            self.enter(MetricFamily::Cpu).await?;
            let total = self.next(&self.cpu);
            Ok(CpuData {
                total_percent: total,
                per_core_percent: BTreeMap::from([(0, total), (1, total)]),
                core_count: 2,
            })
        }

        async fn read_memory(&self) -> Result<MemoryData, CollectError> {
            self.enter(MetricFamily::Memory).await?;
            let percent = self.next(&self.memory);
            Ok(MemoryData {
                virtual_memory: usage(percent),
                swap: usage(0.0),
                combined: usage(percent),
            })
        }

        async fn read_partitions(&self) -> Result<Vec<PartitionData>, CollectError> {
            self.enter(MetricFamily::DiskPartitions).await?;
            Ok(vec![PartitionData {
                device: "/dev/sda1".into(),
                mountpoints: vec!["/".into(), "/home".into()],
                fstype: "ext4".into(),
                total: 100_000_000_000,
                used: 25_000_000_000,
                free: 75_000_000_000,
            }])
        }

        async fn read_disk_io_counters(
            &self,
        ) -> Result<HashMap<String, DiskIoCounters>, CollectError> {
            self.enter(MetricFamily::DiskIo).await?;
            Ok(self.io_reads.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn read_top_processes(
            &self,
            metric: ProcessMetric,
            top_n: usize,
        ) -> Result<Vec<ProcessData>, CollectError> {
            self.enter(metric.family()).await?;
            let processes = (1..=3)
                .map(|pid| ProcessData {
                    pid,
                    name: format!("worker-{}", pid),
                    cpu_usage_percent: 10.0 * pid as f64,
                    mem_usage_percent: 5.0 * pid as f64,
                    io_read_count: 100 * pid as u64,
                    io_write_count: 10 * pid as u64,
                })
                .collect();
            Ok(process::select_top(processes, metric, top_n))
        }
    }
}

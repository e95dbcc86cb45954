//! Prometheus registry fed from snapshots and sampler events.

use super::Reporter;
use crate::metrics::{MemoryUsage, ProcessData};
use crate::sampler::{SamplerEvent, SamplerEventKind};
use crate::snapshot::Snapshot;
use anyhow::{Context, Result};
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const MB: f64 = 1_000_000.0;
const GB: f64 = 1_000_000_000.0;

/// `(pid, name)` label values of a process series
type ProcessLabels = (String, String);

/// Processes currently in each ranking. Their I/O counters stay exported.
#[derive(Default)]
struct Ranked {
    cpu: HashSet<ProcessLabels>,
    memory: HashSet<ProcessLabels>,
}

impl Ranked {
    fn all(&self) -> HashSet<ProcessLabels> {
        self.cpu.union(&self.memory).cloned().collect()
    }
}

/// Every gauge and counter this process exports, in a registry of its own
pub struct Exposition {
    registry: Registry,
    cpu_overall: Gauge,
    cpu_per_core: GaugeVec,
    overall_memory: GaugeVec,
    virtual_memory: GaugeVec,
    swap_memory: GaugeVec,
    partition_space: GaugeVec,
    partition_mountpoints: GaugeVec,
    disk_io_read: GaugeVec,
    disk_io_write: GaugeVec,
    process_cpu: GaugeVec,
    process_memory: GaugeVec,
    process_io_read: IntCounterVec,
    process_io_write: IntCounterVec,
    sampler_spikes: IntCounterVec,
    sampler_interval: GaugeVec,
    ranked: Mutex<Ranked>,
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help), labels)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
}

impl Exposition {
    pub fn new() -> prometheus::Result<Self> {
        let exposition = Self {
            registry: Registry::new(),
            cpu_overall: Gauge::new("cpu_overall_usage", "CPU overall usage percentage")?,
            cpu_per_core: gauge_vec(
                "cpu_usage_percentage",
                "CPU usage percentage by core",
                &["core"],
            )?,
            overall_memory: gauge_vec(
                "overall_memory_usage",
                "Overall memory usage statistics",
                &["type"],
            )?,
            virtual_memory: gauge_vec(
                "virtual_memory_usage",
                "Virtual memory usage statistics",
                &["type"],
            )?,
            swap_memory: gauge_vec(
                "swap_memory_usage",
                "Swap memory usage statistics",
                &["type"],
            )?,
            partition_space: gauge_vec(
                "partition_space",
                "Partition space statistics",
                &["device", "type"],
            )?,
            partition_mountpoints: gauge_vec(
                "partition_mountpoints",
                "Mount points of each partition",
                &["device", "mount"],
            )?,
            disk_io_read: gauge_vec(
                "disk_io_read_speed",
                "Disk I/O read speed in MB/s",
                &["device"],
            )?,
            disk_io_write: gauge_vec(
                "disk_io_write_speed",
                "Disk I/O write speed in MB/s",
                &["device"],
            )?,
            process_cpu: gauge_vec(
                "process_cpu_usage",
                "Process cpu usage statistics",
                &["pid", "name"],
            )?,
            process_memory: gauge_vec(
                "process_memory_usage",
                "Process memory usage statistics",
                &["pid", "name"],
            )?,
            process_io_read: counter_vec(
                "process_io_read_count",
                "Process I/O read operations",
                &["pid", "name"],
            )?,
            process_io_write: counter_vec(
                "process_io_write_count",
                "Process I/O write operations",
                &["pid", "name"],
            )?,
            sampler_spikes: counter_vec(
                "sampler_spikes_total",
                "Threshold breaches seen by the adaptive samplers",
                &["family"],
            )?,
            sampler_interval: gauge_vec(
                "sampler_interval_seconds",
                "Current polling interval of each adaptive sampler",
                &["family"],
            )?,
            ranked: Mutex::new(Ranked::default()),
        };

        for collector in exposition.collectors() {
            exposition.registry.register(collector)?;
        }
        Ok(exposition)
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.cpu_overall.clone()),
            Box::new(self.cpu_per_core.clone()),
            Box::new(self.overall_memory.clone()),
            Box::new(self.virtual_memory.clone()),
            Box::new(self.swap_memory.clone()),
            Box::new(self.partition_space.clone()),
            Box::new(self.partition_mountpoints.clone()),
            Box::new(self.disk_io_read.clone()),
            Box::new(self.disk_io_write.clone()),
            Box::new(self.process_cpu.clone()),
            Box::new(self.process_memory.clone()),
            Box::new(self.process_io_read.clone()),
            Box::new(self.process_io_write.clone()),
            Box::new(self.sampler_spikes.clone()),
            Box::new(self.sampler_interval.clone()),
        ]
    }

    /// Apply every present family of a snapshot. Absent families keep their last values.
    ///
    /// A present family replaces its series, so devices, mounts, cores and processes that
    /// disappeared are no longer exported.
    pub fn update(&self, snapshot: &Snapshot) {
        if let Some(cpu) = &snapshot.cpu {
            self.cpu_overall.set(cpu.total_percent);
            self.cpu_per_core.reset();
            for (id, usage) in &cpu.per_core_percent {
                let core = core_label(*id);
                self.cpu_per_core
                    .with_label_values(&[core.as_str()])
                    .set(*usage);
            }
        }

        if let Some(memory) = &snapshot.memory {
            set_memory(&self.overall_memory, &memory.combined);
            set_memory(&self.virtual_memory, &memory.virtual_memory);
            set_memory(&self.swap_memory, &memory.swap);
        }

        if let Some(partitions) = &snapshot.disk_partitions {
            self.partition_space.reset();
            self.partition_mountpoints.reset();
            for partition in partitions {
                let device = partition.device.as_str();
                let space = |kind: &str, value: f64| {
                    self.partition_space
                        .with_label_values(&[device, kind])
                        .set(value);
                };
                space("total_gb", partition.total as f64 / GB);
                space("used_gb", partition.used as f64 / GB);
                space("free_gb", partition.free as f64 / GB);
                space("used_percent", partition.used_percent());

                for mount in &partition.mountpoints {
                    self.partition_mountpoints
                        .with_label_values(&[device, mount.as_str()])
                        .set(1.0);
                }
            }
        }

        if let Some(disk_io) = &snapshot.disk_io {
            self.disk_io_read.reset();
            self.disk_io_write.reset();
            for io in disk_io {
                let device = io.device.as_str();
                self.disk_io_read
                    .with_label_values(&[device])
                    .set(io.read_speed / MB);
                self.disk_io_write
                    .with_label_values(&[device])
                    .set(io.write_speed / MB);
            }
        }

        if snapshot.top_processes_cpu.is_some() || snapshot.top_processes_memory.is_some() {
            self.update_processes(snapshot);
        }
    }

    fn update_processes(&self, snapshot: &Snapshot) {
        let mut ranked = self.ranked.lock().unwrap_or_else(PoisonError::into_inner);
        let before = ranked.all();

        if let Some(processes) = &snapshot.top_processes_cpu {
            ranked.cpu = self.rank(&self.process_cpu, processes, |p| p.cpu_usage_percent);
        }
        if let Some(processes) = &snapshot.top_processes_memory {
            ranked.memory = self.rank(&self.process_memory, processes, |p| p.mem_usage_percent);
        }

        let after = ranked.all();
        for (pid, name) in before.difference(&after) {
            for counter in [&self.process_io_read, &self.process_io_write] {
                if let Err(e) = counter.remove_label_values(&[pid.as_str(), name.as_str()]) {
                    debug!(pid = %pid, error = %e, "Process counter already gone");
                }
            }
        }
    }

    /// Replace a ranking's gauges and return the labels it now holds
    fn rank(
        &self,
        gauge: &GaugeVec,
        processes: &[ProcessData],
        usage: fn(&ProcessData) -> f64,
    ) -> HashSet<ProcessLabels> {
        gauge.reset();
        processes
            .iter()
            .map(|p| {
                let pid = p.pid.to_string();
                gauge
                    .with_label_values(&[pid.as_str(), p.name.as_str()])
                    .set(usage(p));
                self.track_io(&pid, p);
                (pid, p.name.clone())
            })
            .collect()
    }

    /// Counters follow the process's own cumulative totals; they never go backwards
    fn track_io(&self, pid: &str, p: &ProcessData) {
        for (counter, current) in [
            (&self.process_io_read, p.io_read_count),
            (&self.process_io_write, p.io_write_count),
        ] {
            let counter = counter.with_label_values(&[pid, p.name.as_str()]);
            let seen = counter.get();
            if current > seen {
                counter.inc_by(current - seen);
            }
        }
    }

    pub fn set_sampler_interval(&self, family: &str, interval: Duration) {
        self.sampler_interval
            .with_label_values(&[family])
            .set(interval.as_secs_f64());
    }

    pub fn record_sampler_event(&self, event: &SamplerEvent) {
        let family = event.family.as_str();
        match event.kind {
            SamplerEventKind::Spike(_) => self.sampler_spikes.with_label_values(&[family]).inc(),
            SamplerEventKind::Escalated(interval) | SamplerEventKind::Reverted(interval) => {
                self.set_sampler_interval(family, interval)
            }
            SamplerEventKind::Reading(_) | SamplerEventKind::ReadFailed => {}
        }
    }

    /// Text exposition format of everything currently registered
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Encoded metrics are not UTF-8")
    }

    /// Remove every metric from the registry
    pub fn shutdown(&self) {
        for collector in self.collectors() {
            if let Err(e) = self.registry.unregister(collector) {
                debug!(error = %e, "Metric was already unregistered");
            }
        }
    }
}

fn core_label(id: usize) -> String {
    format!("core_{}", id + 1)
}

fn set_memory(vec: &GaugeVec, usage: &MemoryUsage) {
    vec.with_label_values(&["used_percent"]).set(usage.used_percent);
    vec.with_label_values(&["total_mb"]).set(usage.total as f64 / MB);
    vec.with_label_values(&["used_mb"]).set(usage.used as f64 / MB);
    vec.with_label_values(&["free_mb"]).set(usage.free as f64 / MB);
}

/// Feeds each completed snapshot into a shared [`Exposition`]
pub struct ExpositionReporter {
    exposition: Arc<Exposition>,
}

impl ExpositionReporter {
    pub fn new(exposition: Arc<Exposition>) -> Self {
        Self { exposition }
    }
}

impl Reporter for ExpositionReporter {
    fn name(&self) -> &str {
        "exposition"
    }

    fn report(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.exposition.update(snapshot);
        Ok(())
    }
}

/// Drain sampler events into the registry until every sampler has stopped
pub async fn forward_sampler_events(
    mut events: mpsc::UnboundedReceiver<SamplerEvent>,
    exposition: Arc<Exposition>,
) {
    while let Some(event) = events.recv().await {
        exposition.record_sampler_event(&event);
    }
    debug!("Sampler event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuData, DiskIoData, MemoryData, MetricFamily, PartitionData};
    use std::collections::BTreeMap;
    use tokio::time::Instant;

    /// Value of the first sample of `name` carrying every label fragment
    fn sample(text: &str, name: &str, labels: &[&str]) -> Option<f64> {
        text.lines()
            .filter(|l| !l.starts_with('#'))
            .filter(|l| {
                l.strip_prefix(name)
                    .is_some_and(|rest| rest.starts_with('{') || rest.starts_with(' '))
            })
            .find(|l| labels.iter().all(|frag| l.contains(frag)))
            .and_then(|l| l.rsplit(' ').next())
            .and_then(|v| v.parse().ok())
    }

    /// Number of exported series of `name`
    fn series(text: &str, name: &str) -> usize {
        text.lines()
            .filter(|l| l.strip_prefix(name).is_some_and(|rest| rest.starts_with('{')))
            .count()
    }

    fn usage(total: u64, used: u64) -> MemoryUsage {
        MemoryUsage {
            total,
            used,
            free: total - used,
            used_percent: 100.0 * used as f64 / total as f64,
        }
    }

    fn process(pid: u32, name: &str, reads: u64) -> ProcessData {
        ProcessData {
            pid,
            name: name.to_string(),
            cpu_usage_percent: 30.0,
            mem_usage_percent: 4.0,
            io_read_count: reads,
            io_write_count: 5,
        }
    }

    fn cpu_only(total: f64) -> Snapshot {
        Snapshot {
            cpu: Some(CpuData {
                total_percent: total,
                per_core_percent: BTreeMap::from([(0, total), (1, total / 2.0)]),
                core_count: 2,
            }),
            ..Snapshot::default()
        }
    }

    #[test]
    fn snapshot_fields_become_series() {
        let exposition = Exposition::new().unwrap();
        let snapshot = Snapshot {
            memory: Some(MemoryData {
                virtual_memory: usage(4_000_000, 1_000_000),
                swap: usage(2_000_000, 0),
                combined: usage(6_000_000, 1_000_000),
            }),
            disk_partitions: Some(vec![PartitionData {
                device: "/dev/sda1".into(),
                mountpoints: vec!["/".into(), "/home".into()],
                fstype: "ext4".into(),
                total: 100_000_000_000,
                used: 25_000_000_000,
                free: 75_000_000_000,
            }]),
            disk_io: Some(vec![DiskIoData {
                device: "sda".into(),
                read_speed: 3_000_000.0,
                write_speed: 0.0,
            }]),
            top_processes_cpu: Some(vec![process(101, "postgres", 40)]),
            ..cpu_only(42.0)
        };

        exposition.update(&snapshot);
        let text = exposition.encode().unwrap();

        assert_eq!(sample(&text, "cpu_overall_usage", &[]), Some(42.0));
        assert_eq!(
            sample(&text, "cpu_usage_percentage", &[r#"core="core_2""#]),
            Some(21.0)
        );
        assert_eq!(
            sample(&text, "virtual_memory_usage", &[r#"type="total_mb""#]),
            Some(4.0)
        );
        assert_eq!(
            sample(&text, "overall_memory_usage", &[r#"type="free_mb""#]),
            Some(5.0)
        );
        assert_eq!(
            sample(
                &text,
                "partition_space",
                &[r#"device="/dev/sda1""#, r#"type="used_gb""#]
            ),
            Some(25.0)
        );
        assert_eq!(
            sample(&text, "partition_mountpoints", &[r#"mount="/home""#]),
            Some(1.0)
        );
        assert_eq!(
            sample(&text, "disk_io_read_speed", &[r#"device="sda""#]),
            Some(3.0)
        );
        assert_eq!(
            sample(&text, "process_cpu_usage", &[r#"pid="101""#, r#"name="postgres""#]),
            Some(30.0)
        );
        assert_eq!(
            sample(&text, "process_io_read_count", &[r#"pid="101""#]),
            Some(40.0)
        );
        assert!(text.contains("# TYPE process_io_read_count counter"));
    }

    #[test]
    fn absent_fields_keep_previous_values() {
        let exposition = Exposition::new().unwrap();
        exposition.update(&cpu_only(42.0));
        exposition.update(&Snapshot::default());

        let text = exposition.encode().unwrap();
        assert_eq!(sample(&text, "cpu_overall_usage", &[]), Some(42.0));
    }

    #[test]
    fn process_gauges_only_hold_current_top_n() {
        let exposition = Exposition::new().unwrap();
        let top = |p: ProcessData| Snapshot {
            top_processes_cpu: Some(vec![p]),
            ..Snapshot::default()
        };

        exposition.update(&top(process(1, "old", 10)));
        exposition.update(&top(process(2, "new", 10)));

        let text = exposition.encode().unwrap();
        assert_eq!(sample(&text, "process_cpu_usage", &[r#"pid="1""#]), None);
        assert_eq!(
            sample(&text, "process_cpu_usage", &[r#"pid="2""#]),
            Some(30.0)
        );
        assert_eq!(sample(&text, "process_io_read_count", &[r#"pid="1""#]), None);
        assert_eq!(
            sample(&text, "process_io_read_count", &[r#"pid="2""#]),
            Some(10.0)
        );
    }

    #[test]
    fn churning_processes_do_not_grow_the_registry() {
        let exposition = Exposition::new().unwrap();
        let resident = process(1, "init", 7);

        for pid in 1000..1500 {
            exposition.update(&Snapshot {
                top_processes_cpu: Some(vec![process(pid, "job", 3)]),
                top_processes_memory: Some(vec![resident.clone()]),
                ..Snapshot::default()
            });
        }
        // Only the CPU ranking changes; the memory leader keeps its counters
        exposition.update(&Snapshot {
            top_processes_cpu: Some(vec![process(2000, "job", 3)]),
            ..Snapshot::default()
        });

        let text = exposition.encode().unwrap();
        assert_eq!(series(&text, "process_cpu_usage"), 1);
        assert_eq!(series(&text, "process_io_read_count"), 2);
        assert_eq!(series(&text, "process_io_write_count"), 2);
        assert_eq!(
            sample(&text, "process_io_read_count", &[r#"pid="1""#]),
            Some(7.0)
        );
        assert_eq!(
            sample(&text, "process_io_read_count", &[r#"pid="2000""#]),
            Some(3.0)
        );
        assert_eq!(sample(&text, "process_io_read_count", &[r#"pid="1499""#]), None);
    }

    #[test]
    fn vanished_devices_and_cores_are_dropped() {
        let exposition = Exposition::new().unwrap();
        let disks = |device: &str, mount: &str| Snapshot {
            disk_partitions: Some(vec![PartitionData {
                device: format!("/dev/{}1", device),
                mountpoints: vec![mount.into()],
                fstype: "ext4".into(),
                total: 1_000_000_000,
                used: 0,
                free: 1_000_000_000,
            }]),
            disk_io: Some(vec![DiskIoData {
                device: device.into(),
                read_speed: 1_000_000.0,
                write_speed: 0.0,
            }]),
            cpu: Some(CpuData {
                total_percent: 10.0,
                per_core_percent: BTreeMap::from([(3, 10.0)]),
                core_count: 1,
            }),
            ..Snapshot::default()
        };

        exposition.update(&cpu_only(42.0));
        exposition.update(&disks("sda", "/"));
        exposition.update(&disks("sdb", "/data"));

        let text = exposition.encode().unwrap();
        assert_eq!(sample(&text, "disk_io_read_speed", &[r#"device="sda""#]), None);
        assert_eq!(
            sample(&text, "disk_io_read_speed", &[r#"device="sdb""#]),
            Some(1.0)
        );
        assert_eq!(series(&text, "partition_mountpoints"), 1);
        assert_eq!(
            sample(&text, "partition_mountpoints", &[r#"mount="/data""#]),
            Some(1.0)
        );
        assert_eq!(series(&text, "partition_space"), 4);
        assert_eq!(series(&text, "cpu_usage_percentage"), 1);
        assert_eq!(
            sample(&text, "cpu_usage_percentage", &[r#"core="core_4""#]),
            Some(10.0)
        );
    }

    #[test]
    fn io_counters_track_totals_without_going_backwards() {
        let exposition = Exposition::new().unwrap();
        let top = |reads: u64| Snapshot {
            top_processes_memory: Some(vec![process(7, "db", reads)]),
            ..Snapshot::default()
        };

        let reads = |e: &Exposition| {
            sample(&e.encode().unwrap(), "process_io_read_count", &[r#"pid="7""#])
        };

        exposition.update(&top(40));
        assert_eq!(reads(&exposition), Some(40.0));
        exposition.update(&top(55));
        assert_eq!(reads(&exposition), Some(55.0));
        exposition.update(&top(30));
        assert_eq!(reads(&exposition), Some(55.0));
    }

    #[test]
    fn sampler_events_update_their_series() {
        let exposition = Exposition::new().unwrap();
        let event = |kind| SamplerEvent {
            family: MetricFamily::Cpu,
            at: Instant::now(),
            kind,
        };

        exposition.set_sampler_interval("cpu", Duration::from_secs(10));
        exposition.record_sampler_event(&event(SamplerEventKind::Spike(91.0)));
        exposition.record_sampler_event(&event(SamplerEventKind::Spike(93.0)));
        exposition.record_sampler_event(&event(SamplerEventKind::Escalated(
            Duration::from_secs(2),
        )));
        exposition.record_sampler_event(&event(SamplerEventKind::Reading(50.0)));

        let text = exposition.encode().unwrap();
        assert_eq!(
            sample(&text, "sampler_spikes_total", &[r#"family="cpu""#]),
            Some(2.0)
        );
        assert_eq!(
            sample(&text, "sampler_interval_seconds", &[r#"family="cpu""#]),
            Some(2.0)
        );
    }

    #[test]
    fn shutdown_unregisters_everything() {
        let exposition = Exposition::new().unwrap();
        exposition.update(&cpu_only(42.0));
        exposition.shutdown();

        let text = exposition.encode().unwrap();
        assert_eq!(sample(&text, "cpu_overall_usage", &[]), None);
    }

    #[tokio::test]
    async fn forwarded_events_reach_the_registry() {
        let exposition = Arc::new(Exposition::new().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_sampler_events(rx, exposition.clone()));

        tx.send(SamplerEvent {
            family: MetricFamily::Memory,
            at: Instant::now(),
            kind: SamplerEventKind::Spike(88.0),
        })
        .unwrap();
        drop(tx);
        forwarder.await.unwrap();

        let text = exposition.encode().unwrap();
        assert_eq!(
            sample(&text, "sampler_spikes_total", &[r#"family="memory""#]),
            Some(1.0)
        );
    }

    #[test]
    fn reporter_updates_shared_exposition() {
        let exposition = Arc::new(Exposition::new().unwrap());
        let mut reporter = ExpositionReporter::new(exposition.clone());
        reporter.report(&cpu_only(12.0)).unwrap();

        assert_eq!(
            sample(&exposition.encode().unwrap(), "cpu_overall_usage", &[]),
            Some(12.0)
        );
    }
}

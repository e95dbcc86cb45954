//! CPU utilization from two /proc/stat samples taken a window apart.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

/// Raw CPU time values from /proc/stat
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn idle_all(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// One point-in-time read of /proc/stat
#[derive(Debug, Clone, Default)]
pub struct CpuSample {
    pub total: CpuTimes,
    pub per_core: BTreeMap<usize, CpuTimes>,
}

impl CpuSample {
    pub fn read() -> Result<Self> {
        let content = fs::read_to_string("/proc/stat").context("Failed to read /proc/stat")?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut sample = CpuSample::default();

        for line in content.lines() {
            if line.starts_with("cpu ") {
                sample.total = parse_cpu_line(line);
            } else if let Some(rest) = line.strip_prefix("cpu") {
                // Per-core line like "cpu0", "cpu1", etc.
                let core_id = rest
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok());
                if let Some(core_id) = core_id {
                    sample.per_core.insert(core_id, parse_cpu_line(line));
                }
            }
        }

        sample
    }
}

/// Aggregate and per-core CPU usage over one sampling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuData {
    /// Overall CPU utilization percentage
    pub total_percent: f64,
    /// Utilization keyed by the kernel's core id (`cpuN` in /proc/stat)
    pub per_core_percent: BTreeMap<usize, f64>,
    pub core_count: usize,
}

impl CpuData {
    /// Utilization between two samples. Cores missing from either sample are skipped.
    pub fn between(prev: &CpuSample, curr: &CpuSample) -> Self {
        let per_core_percent: BTreeMap<usize, f64> = curr
            .per_core
            .iter()
            .filter_map(|(&id, times)| {
                prev.per_core.get(&id).map(|p| (id, utilization(p, times)))
            })
            .collect();

        Self {
            total_percent: utilization(&prev.total, &curr.total),
            core_count: per_core_percent.len(),
            per_core_percent,
        }
    }
}

fn parse_cpu_line(line: &str) -> CpuTimes {
    let parts: Vec<u64> = line
        .split_whitespace()
        .skip(1) // Skip "cpu" or "cpuN"
        .filter_map(|s| s.parse().ok())
        .collect();

    CpuTimes {
        user: *parts.first().unwrap_or(&0),
        nice: *parts.get(1).unwrap_or(&0),
        system: *parts.get(2).unwrap_or(&0),
        idle: *parts.get(3).unwrap_or(&0),
        iowait: *parts.get(4).unwrap_or(&0),
        irq: *parts.get(5).unwrap_or(&0),
        softirq: *parts.get(6).unwrap_or(&0),
        steal: *parts.get(7).unwrap_or(&0),
    }
}

fn utilization(prev: &CpuTimes, curr: &CpuTimes) -> f64 {
    let total_delta = curr.total().saturating_sub(prev.total());
    if total_delta == 0 {
        return 0.0;
    }

    let idle_delta = curr.idle_all().saturating_sub(prev.idle_all());
    100.0 * (1.0 - (idle_delta as f64 / total_delta as f64))
}

//! Per-process CPU, memory and I/O counters from /proc/[pid]/ files.

use crate::metrics::MetricFamily;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Usage metric used to rank processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMetric {
    Cpu,
    Memory,
}

impl ProcessMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMetric::Cpu => "cpu",
            ProcessMetric::Memory => "memory",
        }
    }

    pub fn family(&self) -> MetricFamily {
        match self {
            ProcessMetric::Cpu => MetricFamily::TopProcessesCpu,
            ProcessMetric::Memory => MetricFamily::TopProcessesMemory,
        }
    }

    fn usage(&self, process: &ProcessData) -> f64 {
        match self {
            ProcessMetric::Cpu => process.cpu_usage_percent,
            ProcessMetric::Memory => process.mem_usage_percent,
        }
    }
}

impl std::fmt::Display for ProcessMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessData {
    pub pid: u32,
    pub name: String,
    /// Average CPU usage since the process started
    pub cpu_usage_percent: f64,
    /// Resident set size as a share of physical memory
    pub mem_usage_percent: f64,
    /// Read syscalls issued (syscr)
    pub io_read_count: u64,
    /// Write syscalls issued (syscw)
    pub io_write_count: u64,
}

/// Host-wide values needed to turn raw process counters into percentages
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    pub uptime_secs: f64,
    pub total_memory: u64,
    pub clock_ticks_per_sec: u64,
    pub page_size: u64,
}

impl HostContext {
    pub fn read() -> Result<Self> {
        let uptime = fs::read_to_string("/proc/uptime").context("Failed to read /proc/uptime")?;
        let uptime_secs = uptime
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .context("Invalid /proc/uptime format")?;

        Ok(Self {
            uptime_secs,
            total_memory: super::memory::read_total_memory()?,
            clock_ticks_per_sec: unsafe { libc::sysconf(libc::_SC_CLK_TCK) as u64 },
            page_size: unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 },
        })
    }
}

/// Raw fields from /proc/[pid]/stat
#[derive(Debug, Clone, PartialEq)]
pub struct ProcStat {
    pub name: String,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
    pub rss_pages: u64,
}

/// Parse /proc/[pid]/stat - format: pid (comm) state fields...
pub fn parse_stat(content: &str) -> Result<ProcStat> {
    // The comm field can contain spaces, so we need to find the last ')' first
    let comm_end = content.rfind(')').context("Invalid stat format")?;
    let comm_start = content.find('(').context("Invalid stat format")?;
    if comm_start >= comm_end {
        anyhow::bail!("Invalid stat format");
    }

    let name = content[comm_start + 1..comm_end].to_string();
    let fields: Vec<&str> = content
        .get(comm_end + 2..)
        .unwrap_or_default()
        .split_whitespace()
        .collect();

    // Fields are 0-indexed from state: utime = 11, stime = 12, starttime = 19, rss = 21
    let field = |i: usize| -> u64 { fields.get(i).and_then(|s| s.parse().ok()).unwrap_or(0) };

    Ok(ProcStat {
        name,
        utime: field(11),
        stime: field(12),
        starttime: field(19),
        rss_pages: field(21),
    })
}

/// Parse syscr/syscw from /proc/[pid]/io
pub fn parse_io_counts(content: &str) -> (u64, u64) {
    let mut syscr: u64 = 0;
    let mut syscw: u64 = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let value: u64 = parts[1].parse().unwrap_or(0);

        match parts[0] {
            "syscr:" => syscr = value,
            "syscw:" => syscw = value,
            _ => {}
        }
    }

    (syscr, syscw)
}

impl ProcessData {
    pub fn from_stat(pid: u32, stat: &ProcStat, io: (u64, u64), host: &HostContext) -> Self {
        let ticks = host.clock_ticks_per_sec.max(1) as f64;
        let cpu_seconds = (stat.utime + stat.stime) as f64 / ticks;
        let elapsed = host.uptime_secs - stat.starttime as f64 / ticks;
        let cpu_usage_percent = if elapsed > 0.0 {
            100.0 * cpu_seconds / elapsed
        } else {
            0.0
        };

        let rss_bytes = stat.rss_pages * host.page_size;
        let mem_usage_percent = if host.total_memory > 0 {
            100.0 * rss_bytes as f64 / host.total_memory as f64
        } else {
            0.0
        };

        Self {
            pid,
            name: stat.name.clone(),
            cpu_usage_percent,
            mem_usage_percent,
            io_read_count: io.0,
            io_write_count: io.1,
        }
    }
}

/// Read every process visible in /proc. Processes that exit mid-scan are skipped.
pub fn read_processes() -> Result<Vec<ProcessData>> {
    let host = HostContext::read()?;
    let entries = fs::read_dir("/proc").context("Failed to read /proc")?;

    let mut processes = Vec::new();
    for entry in entries.flatten() {
        let pid = match entry.file_name().to_str().and_then(|f| f.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let proc_path = entry.path();
        let stat = match fs::read_to_string(proc_path.join("stat"))
            .map_err(anyhow::Error::from)
            .and_then(|s| parse_stat(&s))
        {
            Ok(stat) => stat,
            Err(_) => continue,
        };

        // /proc/[pid]/io is only readable for our own processes unless privileged
        let io = read_io(&proc_path).unwrap_or((0, 0));
        processes.push(ProcessData::from_stat(pid, &stat, io, &host));
    }

    Ok(processes)
}

fn read_io(proc_path: &Path) -> Option<(u64, u64)> {
    fs::read_to_string(proc_path.join("io"))
        .ok()
        .map(|s| parse_io_counts(&s))
}

/// Rank processes by the requested usage, dropping idle ones, and keep the first `top_n`
pub fn select_top(
    mut processes: Vec<ProcessData>,
    metric: ProcessMetric,
    top_n: usize,
) -> Vec<ProcessData> {
    processes.retain(|p| metric.usage(p) > 0.0);
    processes.sort_by(|a, b| metric.usage(b).total_cmp(&metric.usage(a)));
    processes.truncate(top_n);
    processes
}

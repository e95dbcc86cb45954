//! Plain-text rendering of a snapshot for a terminal or log file.

use super::Reporter;
use crate::metrics::{DiskIoData, MemoryUsage, PartitionData, ProcessData};
use crate::snapshot::Snapshot;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::io::Write;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bytes per second
pub fn format_throughput(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

/// Render every present family in a fixed order. Absent families produce no output.
pub fn render(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    if let Some(cpu) = &snapshot.cpu {
        section(&mut out, "CPU Metrics");
        let _ = writeln!(
            out,
            "Overall: {:.2}% ({} cores)",
            cpu.total_percent, cpu.core_count
        );
        for (id, usage) in &cpu.per_core_percent {
            let _ = writeln!(out, "  core_{:<3} {:>6.2}%", id + 1, usage);
        }
    }

    if let Some(memory) = &snapshot.memory {
        section(&mut out, "Memory Metrics");
        memory_line(&mut out, "Overall", &memory.combined);
        memory_line(&mut out, "Virtual", &memory.virtual_memory);
        memory_line(&mut out, "Swap", &memory.swap);
    }

    if let Some(partitions) = &snapshot.disk_partitions {
        section(&mut out, "Disk Partitions");
        for partition in partitions {
            partition_lines(&mut out, partition);
        }
    }

    if let Some(disk_io) = &snapshot.disk_io {
        section(&mut out, "Disk I/O Speeds");
        for io in disk_io {
            disk_io_line(&mut out, io);
        }
    }

    if let Some(processes) = &snapshot.top_processes_cpu {
        section(&mut out, "Top Processes by CPU");
        process_table(&mut out, processes);
    }

    if let Some(processes) = &snapshot.top_processes_memory {
        section(&mut out, "Top Processes by Memory");
        process_table(&mut out, processes);
    }

    out
}

fn section(out: &mut String, title: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    let _ = writeln!(out, "=== {} ===", title);
}

fn memory_line(out: &mut String, label: &str, usage: &MemoryUsage) {
    let _ = writeln!(
        out,
        "{:<8} {:>6.2}%  used {} / {}  free {}",
        format!("{}:", label),
        usage.used_percent,
        format_bytes(usage.used),
        format_bytes(usage.total),
        format_bytes(usage.free)
    );
}

fn partition_lines(out: &mut String, partition: &PartitionData) {
    let _ = writeln!(
        out,
        "{} ({}) {:.2}%  used {} / {}  free {}",
        partition.device,
        partition.fstype,
        partition.used_percent(),
        format_bytes(partition.used),
        format_bytes(partition.total),
        format_bytes(partition.free)
    );
    let _ = writeln!(out, "  mounted on {}", partition.mountpoints.join(", "));
}

fn disk_io_line(out: &mut String, io: &DiskIoData) {
    let _ = writeln!(
        out,
        "{:<12} read {:>12}  write {:>12}",
        io.device,
        format_throughput(io.read_speed),
        format_throughput(io.write_speed)
    );
}

fn process_table(out: &mut String, processes: &[ProcessData]) {
    let _ = writeln!(
        out,
        "{:>8}  {:<20} {:>7} {:>7} {:>10} {:>10}",
        "PID", "NAME", "CPU%", "MEM%", "READS", "WRITES"
    );
    for p in processes {
        let _ = writeln!(
            out,
            "{:>8}  {:<20} {:>7.2} {:>7.2} {:>10} {:>10}",
            p.pid,
            truncate(&p.name, 20),
            p.cpu_usage_percent,
            p.mem_usage_percent,
            p.io_read_count,
            p.io_write_count
        );
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Writes each rendered snapshot to an output stream, stdout by default
pub struct ConsoleReporter {
    out: Box<dyn Write + Send>,
}

impl ConsoleReporter {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

impl Reporter for ConsoleReporter {
    fn name(&self) -> &str {
        "console"
    }

    fn report(&mut self, snapshot: &Snapshot) -> Result<()> {
        let rendered = render(snapshot);
        writeln!(self.out, "{}", rendered).context("Failed to write console report")?;
        self.out.flush().context("Failed to flush console report")?;
        Ok(())
    }
}

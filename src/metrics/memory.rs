//! Virtual, swap and combined memory usage from /proc/meminfo.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// Usage of one memory pool, in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

impl MemoryUsage {
    fn new(total: u64, used: u64, free: u64) -> Self {
        let used_percent = if total > 0 {
            100.0 * used as f64 / total as f64
        } else {
            0.0
        };

        Self {
            total,
            used,
            free,
            used_percent,
        }
    }
}

/// Memory metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryData {
    /// Physical RAM
    #[serde(rename = "virtual")]
    pub virtual_memory: MemoryUsage,
    pub swap: MemoryUsage,
    /// RAM and swap added together; this is what the memory threshold watches
    pub combined: MemoryUsage,
}

impl MemoryData {
    pub fn read() -> Result<Self> {
        let meminfo = fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
        Self::parse(&meminfo)
    }

    pub fn parse(meminfo: &str) -> Result<Self> {
        let mut total: Option<u64> = None;
        let mut free: u64 = 0;
        let mut buffers: u64 = 0;
        let mut cached: u64 = 0;
        let mut swap_total: u64 = 0;
        let mut swap_free: u64 = 0;

        for line in meminfo.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }

            let value: u64 = parts[1].parse().unwrap_or(0) * 1024; // Convert from KB to bytes

            match parts[0] {
                "MemTotal:" => total = Some(value),
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                "SwapTotal:" => swap_total = value,
                "SwapFree:" => swap_free = value,
                _ => {}
            }
        }

        let total = total.context("MemTotal missing from /proc/meminfo")?;
        let used = total.saturating_sub(free + buffers + cached);
        let swap_used = swap_total.saturating_sub(swap_free);

        let virtual_memory = MemoryUsage::new(total, used, free);
        let swap = MemoryUsage::new(swap_total, swap_used, swap_free);
        let combined = MemoryUsage::new(
            virtual_memory.total + swap.total,
            virtual_memory.used + swap.used,
            virtual_memory.free + swap.free,
        );

        Ok(Self {
            virtual_memory,
            swap,
            combined,
        })
    }
}

/// Read MemTotal in bytes, used to turn process RSS into a percentage
pub fn read_total_memory() -> Result<u64> {
    MemoryData::read().map(|m| m.virtual_memory.total)
}

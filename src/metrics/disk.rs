//! Disk partition usage and I/O counters from /proc/mounts, statvfs and /proc/diskstats.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::time::Duration;

const SECTOR_SIZE: u64 = 512;

/// Usage summary for one physical device, possibly mounted in several places
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionData {
    /// Device name (e.g., /dev/sda1)
    pub device: String,
    /// Every mount point sharing the device, in mount-table order
    pub mountpoints: Vec<String>,
    /// File system type (e.g., ext4, btrfs)
    pub fstype: String,
    /// Total space in bytes
    pub total: u64,
    /// Used space in bytes
    pub used: u64,
    /// Free space in bytes
    pub free: u64,
}

impl PartitionData {
    /// Share of the space available to users. Root-reserved blocks are left out.
    pub fn used_percent(&self) -> f64 {
        let usable = self.used + self.free;
        if usable > 0 {
            100.0 * self.used as f64 / usable as f64
        } else {
            0.0
        }
    }
}

/// Cumulative byte counters for one block device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskIoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Read and write throughput of one device over a sampling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskIoData {
    pub device: String,
    /// Bytes per second
    pub read_speed: f64,
    /// Bytes per second
    pub write_speed: f64,
}

/// Filesystem usage as reported by statvfs, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FsUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// One line of /proc/mounts
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
}

/// Read grouped usage for every mounted physical filesystem
pub fn read_partitions() -> Result<Vec<PartitionData>> {
    let filesystems =
        fs::read_to_string("/proc/filesystems").context("Failed to read /proc/filesystems")?;
    let mounts = fs::read_to_string("/proc/mounts").context("Failed to read /proc/mounts")?;

    let nodev = parse_nodev_filesystems(&filesystems);
    let entries = parse_mounts(&mounts)
        .into_iter()
        .filter(|m| !nodev.contains(m.fstype.as_str()))
        .collect();

    Ok(group_partitions(entries, statvfs_usage))
}

/// Filesystem types flagged `nodev` (proc, sysfs, tmpfs, ...)
pub fn parse_nodev_filesystems(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nodev"), Some(fstype)) => Some(fstype.to_string()),
                _ => None,
            }
        })
        .collect()
}

pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            Some(MountEntry {
                device: unescape_mount_field(parts[0]),
                mountpoint: unescape_mount_field(parts[1]),
                fstype: parts[2].to_string(),
            })
        })
        .collect()
}

/// Group mount entries by device. The first mount's usage is kept; later mounts of
/// the same device only add their mount point. Mounts whose usage cannot be read
/// are logged and skipped.
pub fn group_partitions<F>(entries: Vec<MountEntry>, usage: F) -> Vec<PartitionData>
where
    F: Fn(&str) -> Result<FsUsage>,
{
    let mut by_device: BTreeMap<String, PartitionData> = BTreeMap::new();

    for entry in entries {
        let fs_usage = match usage(&entry.mountpoint) {
            Ok(u) => u,
            Err(e) => {
                tracing::debug!(
                    mountpoint = %entry.mountpoint,
                    error = %e,
                    "Skipping mount without usage"
                );
                continue;
            }
        };

        by_device
            .entry(entry.device.clone())
            .and_modify(|p| p.mountpoints.push(entry.mountpoint.clone()))
            .or_insert_with(|| PartitionData {
                device: entry.device,
                mountpoints: vec![entry.mountpoint],
                fstype: entry.fstype,
                total: fs_usage.total,
                used: fs_usage.used,
                free: fs_usage.free,
            });
    }

    by_device.into_values().collect()
}

/// /proc/mounts escapes space, tab, newline and backslash as octal (`\040`)
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(target_os = "linux")]
fn statvfs_usage(path: &str) -> Result<FsUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path).context("Mount point contains a NUL byte")?;
    let mut statvfs = MaybeUninit::<libc::statvfs>::uninit();

    let result = unsafe { libc::statvfs(c_path.as_ptr(), statvfs.as_mut_ptr()) };
    if result != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for {}", path));
    }

    let statvfs = unsafe { statvfs.assume_init() };
    let block_size = statvfs.f_frsize as u64;
    let total = statvfs.f_blocks as u64 * block_size;
    let free = statvfs.f_bavail as u64 * block_size;
    let used = total.saturating_sub(statvfs.f_bfree as u64 * block_size);

    Ok(FsUsage { total, used, free })
}

#[cfg(not(target_os = "linux"))]
fn statvfs_usage(path: &str) -> Result<FsUsage> {
    anyhow::bail!("statvfs unsupported on this platform ({})", path)
}

/// Read cumulative read/write bytes for every whole disk
pub fn read_io_counters() -> Result<HashMap<String, DiskIoCounters>> {
    let diskstats =
        fs::read_to_string("/proc/diskstats").context("Failed to read /proc/diskstats")?;
    Ok(parse_diskstats(&diskstats))
}

pub fn parse_diskstats(content: &str) -> HashMap<String, DiskIoCounters> {
    let mut counters = HashMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }

        let device = parts[2];
        if !is_whole_disk(device) {
            continue;
        }

        let sectors_read: u64 = parts[5].parse().unwrap_or(0);
        let sectors_written: u64 = parts[9].parse().unwrap_or(0);

        counters.insert(
            device.to_string(),
            DiskIoCounters {
                read_bytes: sectors_read * SECTOR_SIZE,
                write_bytes: sectors_written * SECTOR_SIZE,
            },
        );
    }

    counters
}

fn is_whole_disk(device: &str) -> bool {
    // Skip loop devices, ram disks and device-mapper targets
    if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("dm-") {
        return false;
    }

    // Partitions end with a digit (sda1), or 'p' followed by digits for nvme/mmc (nvme0n1p1)
    let ends_with_digit = device
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);

    if device.starts_with("nvme") || device.starts_with("mmcblk") {
        let trimmed = device.trim_end_matches(|c: char| c.is_ascii_digit());
        !(ends_with_digit && trimmed.ends_with('p'))
    } else {
        !ends_with_digit
    }
}

/// Throughput per device present in both reads, sorted by device name.
/// Counter regressions (device reset) read as zero.
pub fn io_speeds(
    initial: &HashMap<String, DiskIoCounters>,
    last: &HashMap<String, DiskIoCounters>,
    window: Duration,
) -> Vec<DiskIoData> {
    let secs = window.as_secs_f64();
    if secs <= 0.0 {
        return Vec::new();
    }

    let mut speeds: Vec<DiskIoData> = initial
        .iter()
        .filter_map(|(device, start)| {
            last.get(device).map(|end| DiskIoData {
                device: device.clone(),
                read_speed: end.read_bytes.saturating_sub(start.read_bytes) as f64 / secs,
                write_speed: end.write_bytes.saturating_sub(start.write_bytes) as f64 / secs,
            })
        })
        .collect();

    speeds.sort_by(|a, b| a.device.cmp(&b.device));
    speeds
}

//! YAML configuration: intervals, thresholds and reporting.

use crate::error::CollectError;
use crate::metrics::MetricFamily;
use crate::round::RoundSettings;
use crate::sampler::SamplerSettings;
use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds between collection rounds, also the samplers' normal interval
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
    /// Seconds between sampler polls while a spike is active
    #[serde(default = "default_log_interval_high_freq")]
    pub log_interval_high_freq: u64,
    /// Seconds high-frequency sampling lasts after the first breach
    #[serde(default = "default_high_freq_duration")]
    pub high_freq_duration: u64,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Seconds between the two disk counter reads of a round
    #[serde(default = "default_disk_io_window")]
    pub disk_io_window: u64,
    /// Seconds between the two /proc/stat reads of a CPU reading
    #[serde(default = "default_cpu_window")]
    pub cpu_window: u64,
    #[serde(default = "default_families")]
    pub families: Vec<MetricFamily>,
    #[serde(default)]
    pub report: ReportConfig,
}

/// Spike thresholds in percent. `disk` and `network` are accepted but not used yet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 80.0,
            disk: 90.0,
            network: 80.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Print each snapshot to stdout
    Console,
    /// Serve a Prometheus registry over HTTP
    Exposition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub mode: ReportMode,
    pub listen: SocketAddr,
    /// Append every snapshot to this JSON Lines file
    pub json_log: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            mode: ReportMode::Console,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            json_log: None,
        }
    }
}

fn default_log_interval() -> u64 {
    10
}

fn default_log_interval_high_freq() -> u64 {
    2
}

fn default_high_freq_duration() -> u64 {
    30
}

fn default_top_n() -> usize {
    10
}

fn default_disk_io_window() -> u64 {
    10
}

fn default_cpu_window() -> u64 {
    1
}

fn default_families() -> Vec<MetricFamily> {
    MetricFamily::ALL.to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_interval: default_log_interval(),
            log_interval_high_freq: default_log_interval_high_freq(),
            high_freq_duration: default_high_freq_duration(),
            thresholds: Thresholds::default(),
            top_n: default_top_n(),
            disk_io_window: default_disk_io_window(),
            cpu_window: default_cpu_window(),
            families: default_families(),
            report: ReportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.log_interval > 0, "log_interval must be at least 1 second");
        ensure!(
            self.log_interval_high_freq > 0,
            "log_interval_high_freq must be at least 1 second"
        );
        ensure!(
            self.high_freq_duration > 0,
            "high_freq_duration must be at least 1 second"
        );
        ensure!(self.disk_io_window > 0, "disk_io_window must be at least 1 second");
        ensure!(self.cpu_window > 0, "cpu_window must be at least 1 second");
        ensure!(self.top_n > 0, "top_n must be at least 1");
        ensure!(!self.families.is_empty(), "families must not be empty");

        let mut seen = HashSet::new();
        for family in &self.families {
            ensure!(seen.insert(family), "family {} listed twice", family);
        }
        Ok(())
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval)
    }

    pub fn cpu_sample_window(&self) -> Duration {
        Duration::from_secs(self.cpu_window)
    }

    pub fn round_settings(&self) -> RoundSettings {
        RoundSettings {
            families: self.families.clone(),
            top_n: self.top_n,
            disk_io_window: Duration::from_secs(self.disk_io_window),
        }
    }

    pub fn sampler_settings(
        &self,
        family: MetricFamily,
    ) -> Result<SamplerSettings, CollectError> {
        let threshold = match family {
            MetricFamily::Cpu => self.thresholds.cpu,
            MetricFamily::Memory => self.thresholds.memory,
            other => {
                return Err(CollectError::UnsupportedMetric(format!(
                    "no threshold configured for {}",
                    other
                )))
            }
        };

        Ok(SamplerSettings {
            threshold,
            normal_interval: self.round_interval(),
            high_freq_interval: Duration::from_secs(self.log_interval_high_freq),
            high_freq_duration: Duration::from_secs(self.high_freq_duration),
        })
    }
}

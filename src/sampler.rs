//! Adaptive threshold sampling.
//!
//! Each [`ThresholdSampler`] polls one metric family on its own clock. A reading above
//! the threshold switches it to the high-frequency interval for a fixed window measured
//! from that first breach; further breaches inside the window do not extend it.

use crate::error::CollectError;
use crate::metrics::MetricFamily;
use crate::source::MetricSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Threshold and interval configuration for one sampler
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    /// Readings strictly above this value are spikes
    pub threshold: f64,
    pub normal_interval: Duration,
    pub high_freq_interval: Duration,
    /// How long high-frequency sampling lasts after the breach that started it
    pub high_freq_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Normal,
    Elevated,
}

/// Interval state owned by a single sampler loop
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingState {
    current_interval: Duration,
    high_freq_active: bool,
    high_freq_deadline: Option<Instant>,
}

impl SamplingState {
    pub fn new(normal_interval: Duration) -> Self {
        Self {
            current_interval: normal_interval,
            high_freq_active: false,
            high_freq_deadline: None,
        }
    }

    pub fn mode(&self) -> SamplingMode {
        if self.high_freq_active {
            SamplingMode::Elevated
        } else {
            SamplingMode::Normal
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.high_freq_deadline
    }

    /// Apply one reading. Returns true if this reading moved the sampler to `Elevated`.
    ///
    /// Only the first breach arms the deadline; a breach while already elevated is a no-op.
    pub fn observe(&mut self, breach: bool, now: Instant, settings: &SamplerSettings) -> bool {
        if !breach || self.high_freq_active {
            return false;
        }

        self.current_interval = settings.high_freq_interval;
        self.high_freq_active = true;
        self.high_freq_deadline = Some(now + settings.high_freq_duration);
        true
    }

    /// The high-frequency window elapsed. Returns true if the sampler went back to `Normal`.
    pub fn expire(&mut self, settings: &SamplerSettings) -> bool {
        if !self.high_freq_active {
            return false;
        }

        self.current_interval = settings.normal_interval;
        self.high_freq_active = false;
        self.high_freq_deadline = None;
        true
    }
}

/// Something a sampler observed or did, with the (tokio) time it happened
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerEvent {
    pub family: MetricFamily,
    pub at: Instant,
    pub kind: SamplerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SamplerEventKind {
    Reading(f64),
    Spike(f64),
    /// Switched to high frequency; carries the new interval
    Escalated(Duration),
    /// Back to normal; carries the new interval
    Reverted(Duration),
    ReadFailed,
}

/// Polls one metric family at an adaptive rate until cancelled
pub struct ThresholdSampler {
    family: MetricFamily,
    settings: SamplerSettings,
    state: SamplingState,
    source: Arc<dyn MetricSource>,
    events: Option<mpsc::UnboundedSender<SamplerEvent>>,
}

impl ThresholdSampler {
    /// Only families with a single scalar reading (`cpu`, `memory`) can be sampled.
    pub fn new(
        family: MetricFamily,
        settings: SamplerSettings,
        source: Arc<dyn MetricSource>,
    ) -> Result<Self, CollectError> {
        if !matches!(family, MetricFamily::Cpu | MetricFamily::Memory) {
            return Err(CollectError::UnsupportedMetric(format!(
                "{} has no threshold reading",
                family
            )));
        }

        Ok(Self {
            family,
            state: SamplingState::new(settings.normal_interval),
            settings,
            source,
            events: None,
        })
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SamplerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            family = %self.family,
            threshold = self.settings.threshold,
            interval_secs = self.settings.normal_interval.as_secs_f64(),
            "Threshold sampler started"
        );

        loop {
            let deadline = self.state.deadline();
            let expiry = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            // The deadline wins a tie with the poll timer
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = expiry => {
                    if self.state.expire(&self.settings) {
                        info!(family = %self.family, "Reverting to normal sampling");
                        self.emit(SamplerEventKind::Reverted(self.state.current_interval()));
                    }
                    continue;
                }
                _ = time::sleep(self.state.current_interval()) => {}
            }

            let reading = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                reading = self.read() => reading,
            };

            match reading {
                Ok(value) => self.evaluate(value),
                Err(e) => {
                    warn!(family = %self.family, error = %e, "Sampling read failed");
                    self.emit(SamplerEventKind::ReadFailed);
                }
            }
        }

        debug!(family = %self.family, mode = ?self.state.mode(), "Threshold sampler stopped");
    }

    async fn read(&self) -> Result<f64, CollectError> {
        match self.family {
            MetricFamily::Cpu => self.source.read_cpu().await.map(|c| c.total_percent),
            MetricFamily::Memory => self
                .source
                .read_memory()
                .await
                .map(|m| m.combined.used_percent),
            other => Err(CollectError::UnsupportedMetric(other.to_string())),
        }
    }

    fn evaluate(&mut self, value: f64) {
        self.emit(SamplerEventKind::Reading(value));

        let breach = value > self.settings.threshold;
        if breach {
            warn!(family = %self.family, value = format_args!("{:.2}%", value), "Spike detected");
            self.emit(SamplerEventKind::Spike(value));
        }

        if self.state.observe(breach, Instant::now(), &self.settings) {
            info!(
                family = %self.family,
                interval_secs = self.state.current_interval().as_secs_f64(),
                "Switching to high frequency sampling"
            );
            self.emit(SamplerEventKind::Escalated(self.state.current_interval()));
        }
    }

    fn emit(&self, kind: SamplerEventKind) {
        if let Some(events) = &self.events {
            // A closed receiver only means nobody is listening any more
            let _ = events.send(SamplerEvent {
                family: self.family,
                at: Instant::now(),
                kind,
            });
        }
    }
}

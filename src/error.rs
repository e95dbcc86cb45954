//! Error taxonomy for metric collection.

use crate::metrics::MetricFamily;

/// Errors raised while collecting or scheduling metrics
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The OS metric source could not produce a reading.
    #[error("{family} source unavailable: {reason}")]
    SourceUnavailable { family: MetricFamily, reason: String },

    /// A metric family was requested from a path that cannot serve it.
    #[error("unsupported metric: {0}")]
    UnsupportedMetric(String),

    /// One or more fan-out tasks failed; the round still completed.
    #[error("round completed without {}", join_families(.failed))]
    PartialRoundFailure { failed: Vec<MetricFamily> },

    /// Collection was abandoned because shutdown began.
    #[error("collection cancelled")]
    Cancelled,
}

impl CollectError {
    pub fn unavailable(family: MetricFamily, err: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            family,
            reason: err.to_string(),
        }
    }
}

fn join_families(families: &[MetricFamily]) -> String {
    families
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

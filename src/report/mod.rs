//! Reporters turn a completed snapshot into output.

pub mod console;
pub mod exposition;
pub mod snapshot_log;

pub use console::ConsoleReporter;
pub use exposition::{Exposition, ExpositionReporter};
pub use snapshot_log::SnapshotLogger;

use crate::snapshot::Snapshot;
use anyhow::Result;

/// Receives each finished snapshot exactly once, in round order
pub trait Reporter: Send {
    fn name(&self) -> &str;

    fn report(&mut self, snapshot: &Snapshot) -> Result<()>;
}

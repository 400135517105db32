//! Node configuration knobs used by the migration subsystem.

use serde::Deserialize;

pub const DEFAULT_MIGRATE_SPEED: u64 = 4096;
pub const DEFAULT_PIPELINE_SIZE: usize = 16;
pub const DEFAULT_SEQUENCE_GAP: u64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Maximum migration throughput in destination commands per second.
    /// Zero disables the limit.
    pub migrate_speed: u64,
    /// Number of commands buffered per pipeline flush.
    pub migrate_pipeline_size: usize,
    /// Largest WAL gap tolerated before the cutover is taken.
    pub migrate_sequence_gap: u64,
    /// Cluster password; also used to AUTH against the destination.
    pub requirepass: Option<String>,
    /// Whether this node runs as a replica. A replica never migrates.
    pub replica: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            migrate_speed: DEFAULT_MIGRATE_SPEED,
            migrate_pipeline_size: DEFAULT_PIPELINE_SIZE,
            migrate_sequence_gap: DEFAULT_SEQUENCE_GAP,
            requirepass: None,
            replica: false,
        }
    }
}

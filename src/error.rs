// ABOUTME: Fatal error taxonomy for the dump pipeline
// ABOUTME: Per-job failures stay plain anyhow errors; these abort the whole run

use thiserror::Error;

/// Conditions that stop the dump instead of being counted and skipped
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("{0}")]
    Fatal(String),

    #[error(
        "Backup will not be consistent: workers observed different positions after {rounds} attempt(s). \
         Use no_locks if you expect inconsistent backups."
    )]
    InconsistentSnapshot { rounds: usize },

    #[error("Broken table detected: {database}.{table}")]
    BrokenTable { database: String, table: String },

    #[error("Unexpected job '{0}' on this queue. This must be a bug")]
    UnknownJob(&'static str),

    #[error("Dump interrupted before it finished; the output directory is incomplete")]
    Interrupted,
}

/// Returns true when the error (or anything in its chain) is fatal
pub fn is_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<DumpError>())
}

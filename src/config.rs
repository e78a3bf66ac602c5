// ABOUTME: Dump options and their TOML configuration file format
// ABOUTME: Also parses the rows-per-chunk floor:target:ceiling triple

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Floor is the nominal rows-per-chunk divided by this when no triple is given
pub const DEFAULT_FLOOR_DIVISOR: u64 = 100;
/// Ceiling is the nominal rows-per-chunk multiplied by this when no triple is given
pub const DEFAULT_CEILING_FACTOR: u64 = 100;
/// Outstanding jobs on one queue before producers start pausing
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 200_000;

/// Every knob the dump engine reads
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DumpOptions {
    pub threads: usize,
    /// `"N"`, `"floor:target"` or `"floor:target:ceiling"`
    pub rows: Option<String>,
    pub output_dir: PathBuf,
    /// Skip the global read lock and accept an inconsistent backup
    pub no_locks: bool,
    /// Hold per-table locks on non-transactional tables instead of the global lock
    pub less_locking: bool,
    /// Treat every table as transactional
    pub trx_consistency_only: bool,
    pub no_schemas: bool,
    pub no_data: bool,
    pub triggers: bool,
    pub routines: bool,
    pub events: bool,
    pub no_views: bool,
    pub views_as_tables: bool,
    pub no_sequences: bool,
    pub ignore_engines: Vec<String>,
    pub checksums: bool,
    pub build_empty_files: bool,
    pub exit_on_broken_table: bool,
    pub skip_tz: bool,
    /// Upper bound in bytes for one INSERT statement
    pub statement_size: usize,
    /// Global row filter appended to every data query
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    pub complete_insert: bool,
    pub ignore_generated_fields: bool,
    pub order_by_primary: bool,
    /// Skip tables not updated within this many days
    pub updated_since: Option<u32>,
    pub databases: Vec<String>,
    pub exclude_databases: Vec<String>,
    /// Explicit `db.table` list; discovery only looks at these
    pub tables_list: Vec<String>,
    pub regex: Option<String>,
    pub skip_list: Option<PathBuf>,
    pub queue_high_water: usize,
    #[serde(with = "seconds")]
    pub queue_pause: Duration,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            rows: None,
            output_dir: PathBuf::from("export"),
            no_locks: false,
            less_locking: false,
            trx_consistency_only: false,
            no_schemas: false,
            no_data: false,
            triggers: false,
            routines: false,
            events: false,
            no_views: false,
            views_as_tables: false,
            no_sequences: false,
            ignore_engines: Vec::new(),
            checksums: false,
            build_empty_files: false,
            exit_on_broken_table: false,
            skip_tz: false,
            statement_size: 1_000_000,
            where_clause: None,
            complete_insert: false,
            ignore_generated_fields: false,
            order_by_primary: false,
            updated_since: None,
            databases: Vec::new(),
            exclude_databases: Vec::new(),
            tables_list: Vec::new(),
            regex: None,
            skip_list: None,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            queue_pause: Duration::from_secs(5),
        }
    }
}

impl DumpOptions {
    /// Check option combinations that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.less_locking && self.no_locks {
            bail!("less_locking requires the global read lock; it cannot be combined with no_locks");
        }
        if self.statement_size == 0 {
            bail!("statement_size must be positive");
        }
        if let Some(rows) = &self.rows {
            RowsPerChunk::parse(rows)?;
        }
        Ok(())
    }

    /// Chunk sizing derived from the rows option, `None` when chunking is off
    pub fn rows_per_chunk(&self) -> Result<Option<RowsPerChunk>> {
        match &self.rows {
            Some(value) => {
                let rows = RowsPerChunk::parse(value)?;
                Ok((rows.target > 0).then_some(rows))
            }
            None => Ok(None),
        }
    }

    /// Whether the coordinator takes `FLUSH TABLES WITH READ LOCK`
    pub fn uses_global_lock(&self) -> bool {
        !self.no_locks
    }
}

/// Adaptive chunk sizing bounds in rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowsPerChunk {
    pub floor: u64,
    pub target: u64,
    pub ceiling: u64,
}

impl RowsPerChunk {
    /// Nominal size with the default 1% floor and 100x ceiling
    pub fn from_target(target: u64) -> Self {
        Self {
            floor: (target / DEFAULT_FLOOR_DIVISOR).max(1),
            target,
            ceiling: target.saturating_mul(DEFAULT_CEILING_FACTOR),
        }
    }

    /// Parse `"N"`, `"floor:target"` or `"floor:target:ceiling"`
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<u64> = value
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid rows value '{}': must be an integer", part))
            })
            .collect::<Result<_>>()?;

        let rows = match parts.as_slice() {
            [target] => Self::from_target(*target),
            [floor, target] => Self {
                floor: *floor,
                target: *target,
                ceiling: *target,
            },
            [floor, target, ceiling] => Self {
                floor: *floor,
                target: *target,
                ceiling: *ceiling,
            },
            _ => bail!("rows must be N, floor:target or floor:target:ceiling, got '{}'", value),
        };

        if rows.target > 0 && (rows.floor == 0 || rows.floor > rows.target || rows.target > rows.ceiling) {
            bail!(
                "rows '{}' must satisfy 0 < floor <= target <= ceiling",
                value
            );
        }

        Ok(rows)
    }
}

pub fn load_dump_options(path: &str) -> Result<DumpOptions> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path))?;
    let options: DumpOptions =
        toml::from_str(&raw).with_context(|| format!("Failed to parse TOML config at {}", path))?;
    options.validate()?;
    Ok(options)
}

mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid queue_pause {}: {}", secs, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn rows_single_value_uses_default_ratios() {
        let rows = RowsPerChunk::parse("1000").unwrap();
        assert_eq!(rows.floor, 10);
        assert_eq!(rows.target, 1000);
        assert_eq!(rows.ceiling, 100_000);
    }

    #[test]
    fn rows_small_target_keeps_floor_positive() {
        let rows = RowsPerChunk::parse("50").unwrap();
        assert_eq!(rows.floor, 1);
    }

    #[test]
    fn rows_explicit_triple() {
        let rows = RowsPerChunk::parse("100:1000:5000").unwrap();
        assert_eq!(
            rows,
            RowsPerChunk {
                floor: 100,
                target: 1000,
                ceiling: 5000
            }
        );
    }

    #[test]
    fn rows_pair_caps_at_target() {
        let rows = RowsPerChunk::parse("10:200").unwrap();
        assert_eq!(rows.ceiling, 200);
    }

    #[test]
    fn rows_rejects_garbage_and_bad_ordering() {
        assert!(RowsPerChunk::parse("abc").is_err());
        assert!(RowsPerChunk::parse("1:2:3:4").is_err());
        assert!(RowsPerChunk::parse("500:100:1000").is_err());
        assert!(RowsPerChunk::parse("0:100:1000").is_err());
    }

    #[test]
    fn zero_rows_disables_chunking() {
        let options = DumpOptions {
            rows: Some("0".into()),
            ..Default::default()
        };
        assert!(options.rows_per_chunk().unwrap().is_none());
    }

    #[test]
    fn validate_rejects_conflicting_locking_modes() {
        let options = DumpOptions {
            less_locking: true,
            no_locks: true,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn parse_sample_config() {
        let mut tmp = NamedTempFile::new().unwrap();
        let contents = r#"
            threads = 8
            rows = "100:1000:100000"
            output_dir = "/var/backups/shop"
            less_locking = true
            ignore_engines = ["BLACKHOLE", "FEDERATED"]
            where = "deleted_at IS NULL"
            queue_pause = 0.5
        "#;
        write!(tmp, "{}", contents).unwrap();

        let options = load_dump_options(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(options.threads, 8);
        assert!(options.less_locking);
        assert_eq!(options.ignore_engines, vec!["BLACKHOLE", "FEDERATED"]);
        assert_eq!(options.where_clause.as_deref(), Some("deleted_at IS NULL"));
        assert_eq!(options.queue_pause, Duration::from_millis(500));
        assert_eq!(options.rows_per_chunk().unwrap().unwrap().floor, 100);
        assert_eq!(options.statement_size, 1_000_000);
    }

    #[test]
    fn out_of_range_queue_pause_is_rejected() {
        for value in ["-1.0", "1e300"] {
            let mut tmp = NamedTempFile::new().unwrap();
            write!(tmp, "queue_pause = {}\n", value).unwrap();

            let err = load_dump_options(tmp.path().to_str().unwrap()).unwrap_err();
            assert!(
                format!("{:#}", err).contains("invalid queue_pause"),
                "unexpected error for {}: {:#}",
                value,
                err
            );
        }
    }
}

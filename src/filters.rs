// ABOUTME: Central filtering logic for selective dumps
// ABOUTME: Handles database lists, skip lists, the inclusion regex and freshness exclusion

use crate::config::DumpOptions;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Schemas the server maintains itself; never dumped
const SYSTEM_DATABASES: &[&str] = &[
    "information_schema",
    "performance_schema",
    "data_dictionary",
    "sys",
];

/// Tables in the `mysql` schema that are logs or statistics rather than data
const MYSQL_SPECIAL_TABLES: &[&str] = &[
    "general_log",
    "slow_log",
    "innodb_index_stats",
    "innodb_table_stats",
];

/// Represents dump filtering rules
#[derive(Debug, Clone, Default)]
pub struct DumpFilter {
    include_databases: Option<Vec<String>>,
    exclude_databases: Option<Vec<String>>,
    skip_list: HashSet<String>, // Format: "db.table"
    tables_list: Option<HashSet<String>>, // Format: "db.table"
    pattern: Option<Regex>,
    not_updated: HashSet<String>,
}

impl DumpFilter {
    /// Creates a filter from explicit lists
    pub fn new(
        include_databases: Option<Vec<String>>,
        exclude_databases: Option<Vec<String>>,
        skip_list: Vec<String>,
        tables_list: Option<Vec<String>>,
        pattern: Option<&str>,
    ) -> Result<Self> {
        if include_databases.is_some() && exclude_databases.is_some() {
            bail!("Cannot use both --databases and --exclude-databases");
        }

        for entry in skip_list.iter().chain(tables_list.iter().flatten()) {
            if !entry.contains('.') {
                bail!(
                    "Table must be specified as 'database.table', got '{}'",
                    entry
                );
            }
        }

        let pattern = pattern
            .map(|p| Regex::new(p).with_context(|| format!("Invalid regex '{}'", p)))
            .transpose()?;

        Ok(Self {
            include_databases,
            exclude_databases,
            skip_list: skip_list.into_iter().collect(),
            tables_list: tables_list.map(|tables| tables.into_iter().collect()),
            pattern,
            not_updated: HashSet::new(),
        })
    }

    /// Builds the filter described by the dump options, reading the skip list file
    pub fn from_options(options: &DumpOptions) -> Result<Self> {
        let skip_list = match &options.skip_list {
            Some(path) => read_skip_list(path)?,
            None => Vec::new(),
        };

        Self::new(
            non_empty(&options.databases),
            non_empty(&options.exclude_databases),
            skip_list,
            non_empty(&options.tables_list),
            options.regex.as_deref(),
        )
    }

    /// Excludes tables that have not changed recently
    pub fn with_not_updated(mut self, tables: HashSet<String>) -> Self {
        self.not_updated = tables;
        self
    }

    /// Determines if a database should be dumped
    pub fn should_dump_database(&self, db_name: &str) -> bool {
        if SYSTEM_DATABASES
            .iter()
            .any(|system| system.eq_ignore_ascii_case(db_name))
        {
            return false;
        }

        if let Some(ref include) = self.include_databases {
            if !include.iter().any(|db| db == db_name) {
                return false;
            }
        }

        if let Some(ref exclude) = self.exclude_databases {
            if exclude.iter().any(|db| db == db_name) {
                return false;
            }
        }

        true
    }

    /// True when the table is on the skip list or is a server log table
    pub fn is_skipped(&self, db_name: &str, table_name: &str) -> bool {
        if db_name.eq_ignore_ascii_case("mysql")
            && MYSQL_SPECIAL_TABLES
                .iter()
                .any(|special| special.eq_ignore_ascii_case(table_name))
        {
            return true;
        }
        self.skip_list.contains(&full_name(db_name, table_name))
    }

    /// True when no inclusion pattern is configured or `db.table` matches it
    pub fn matches_pattern(&self, db_name: &str, object_name: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(&full_name(db_name, object_name)),
            None => true,
        }
    }

    /// Determines if a table, view or sequence should be dumped
    ///
    /// The skip list is consulted first and always wins over the pattern.
    pub fn should_dump_table(&self, db_name: &str, table_name: &str) -> bool {
        if self.is_skipped(db_name, table_name) {
            return false;
        }

        let name = full_name(db_name, table_name);
        if let Some(ref tables) = self.tables_list {
            if !tables.contains(&name) {
                return false;
            }
        }

        if self.not_updated.contains(&name) {
            return false;
        }

        self.matches_pattern(db_name, table_name)
    }

    /// Determines if a procedure, function or event should be dumped
    pub fn should_dump_object(&self, db_name: &str, object_name: &str) -> bool {
        !self.skip_list.contains(&full_name(db_name, object_name))
            && self.matches_pattern(db_name, object_name)
    }
}

/// Reads a skip list file: one `db.table` per line, `#` starts a comment
pub fn read_skip_list(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read skip list at {}", path.display()))?;
    Ok(parse_skip_list(&raw))
}

fn parse_skip_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn full_name(db_name: &str, table_name: &str) -> String {
    format!("{}.{}", db_name, table_name)
}

fn non_empty(list: &[String]) -> Option<Vec<String>> {
    (!list.is_empty()).then(|| list.to_vec())
}

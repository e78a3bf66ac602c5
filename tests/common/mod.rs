// ABOUTME: In-process stand-in for a MySQL server used by the pipeline tests
// ABOUTME: Answers the dump engine's queries from fixture tables and logs every statement

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parallel_dumper::connection::{Connector, DumpConnection, ResultSet};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One table the fake server knows about
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub database: &'static str,
    pub name: &'static str,
    /// `None` marks a broken table (or a view)
    pub engine: Option<&'static str>,
    pub table_type: &'static str,
    pub columns: Vec<&'static str>,
    /// Unique key column and its data type; the first column holds its values
    pub key: Option<(&'static str, &'static str)>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Row `i` lives in partition `i % partitions.len()`
    pub partitions: Vec<&'static str>,
    /// Column listing queries for this table fail
    pub unreadable_columns: bool,
}

impl FakeTable {
    /// InnoDB table `(id, note)` keyed on `id` holding ids `1..=rows`
    pub fn innodb(database: &'static str, name: &'static str, rows: i64) -> Self {
        Self::with_ids(database, name, 1..=rows)
    }

    /// InnoDB table `(id, note)` keyed on `id` holding exactly `ids`
    pub fn with_ids(
        database: &'static str,
        name: &'static str,
        ids: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            database,
            name,
            engine: Some("InnoDB"),
            table_type: "BASE TABLE",
            columns: vec!["id", "note"],
            key: Some(("id", "int")),
            rows: ids
                .into_iter()
                .map(|id| vec![Some(id.to_string()), Some(format!("note-{}", id))])
                .collect(),
            partitions: Vec::new(),
            unreadable_columns: false,
        }
    }

    /// MyISAM table `(id, note)` without any unique key
    pub fn myisam(database: &'static str, name: &'static str, rows: i64) -> Self {
        Self {
            engine: Some("MyISAM"),
            key: None,
            ..Self::innodb(database, name, rows)
        }
    }

    pub fn view(database: &'static str, name: &'static str) -> Self {
        Self {
            database,
            name,
            engine: None,
            table_type: "VIEW",
            columns: vec!["id"],
            key: None,
            rows: Vec::new(),
            partitions: Vec::new(),
            unreadable_columns: false,
        }
    }

    pub fn without_key(mut self) -> Self {
        self.key = None;
        self
    }

    /// Key the table on `id` as a varchar, so keys sort as strings ("10" < "9")
    pub fn with_varchar_key(mut self) -> Self {
        self.key = Some(("id", "varchar"));
        self
    }

    /// Spread the rows over `partitions` and drop the unique key
    pub fn partitioned(mut self, partitions: &[&'static str]) -> Self {
        self.key = None;
        self.partitions = partitions.to_vec();
        self
    }

    pub fn with_unreadable_columns(mut self) -> Self {
        self.unreadable_columns = true;
        self
    }

    fn textual_key(&self) -> bool {
        matches!(self.key, Some((_, "varchar" | "char")))
    }
}

/// What each session reports as its snapshot's executed GTID set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Markers {
    /// Every session sees the same position
    Shared,
    /// Every session sees a different position, forever
    PerSession,
    /// The server has no GTID status variable
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedStatement {
    pub session: u64,
    pub sql: String,
}

pub struct FakeServer {
    tables: Vec<FakeTable>,
    markers: Markers,
    next_session: AtomicU64,
    log: Mutex<Vec<LoggedStatement>>,
}

impl FakeServer {
    pub fn new(tables: Vec<FakeTable>, markers: Markers) -> Arc<Self> {
        Arc::new(Self {
            tables,
            markers,
            next_session: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Every statement received so far, in arrival order
    pub fn log(&self) -> Vec<LoggedStatement> {
        self.log.lock().clone()
    }

    /// Positions in the log of statements starting with `prefix`
    pub fn positions(&self, prefix: &str) -> Vec<usize> {
        self.log
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, statement)| statement.sql.starts_with(prefix))
            .map(|(i, _)| i)
            .collect()
    }

    /// Sessions that issued a statement starting with `prefix`
    pub fn sessions_with(&self, prefix: &str) -> BTreeSet<u64> {
        self.log
            .lock()
            .iter()
            .filter(|statement| statement.sql.starts_with(prefix))
            .map(|statement| statement.session)
            .collect()
    }

    /// Data queries issued against `` `db`.`table` ``
    pub fn data_queries(&self, database: &str, table: &str) -> Vec<usize> {
        let target = format!("FROM `{}`.`{}`", database, table);
        self.log
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sql.starts_with(DATA_PREFIX) && s.sql.contains(&target))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn connector(self: &Arc<Self>) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            server: self.clone(),
        })
    }

    fn table(&self, database: &str, name: &str) -> Option<&FakeTable> {
        self.tables
            .iter()
            .find(|t| t.database == database && t.name == name)
    }

    fn respond(&self, session: u64, sql: &str) -> Result<ResultSet> {
        self.log.lock().push(LoggedStatement {
            session,
            sql: sql.to_string(),
        });

        if sql.starts_with("SHOW STATUS LIKE 'binlog_snapshot_gtid_executed'") {
            let marker = match self.markers {
                Markers::Shared => "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-100".to_string(),
                Markers::PerSession => format!("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-{}", session),
                Markers::Missing => return Ok(ResultSet::default()),
            };
            return Ok(text(
                &["Variable_name", "Value"],
                vec![vec![Some("binlog_snapshot_gtid_executed".into()), Some(marker)]],
            ));
        }
        if sql == "SHOW DATABASES" {
            let mut names: BTreeSet<&str> = self.tables.iter().map(|t| t.database).collect();
            names.insert("information_schema");
            return Ok(text(
                &["Database"],
                names.into_iter().map(|n| vec![Some(n.to_string())]).collect(),
            ));
        }
        if sql.starts_with("SELECT TABLE_NAME, ENGINE") {
            return Ok(self.table_listing(sql));
        }
        if sql.starts_with("SELECT CHARACTER_SET_NAME") {
            return Ok(text(&["CHARACTER_SET_NAME"], vec![vec![Some("utf8mb4".into())]]));
        }
        if sql.starts_with("SELECT COLUMN_NAME, EXTRA") {
            if let Some(table) = self.schema_table(sql).filter(|t| t.unreadable_columns) {
                return Err(anyhow!("Can't read columns of {}.{}", table.database, table.name));
            }
            let rows = self
                .schema_table(sql)
                .map(|t| {
                    t.columns
                        .iter()
                        .map(|c| vec![Some(c.to_string()), Some(String::new())])
                        .collect()
                })
                .unwrap_or_default();
            return Ok(text(&["COLUMN_NAME", "EXTRA"], rows));
        }
        if sql.starts_with("SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.STATISTICS") {
            let rows = self
                .schema_table(sql)
                .and_then(|t| t.key)
                .map(|(column, _)| vec![vec![Some(column.to_string())]])
                .unwrap_or_default();
            return Ok(text(&["COLUMN_NAME"], rows));
        }
        if sql.starts_with("SELECT s.COLUMN_NAME, c.DATA_TYPE") {
            let rows = self
                .schema_table(sql)
                .and_then(|t| t.key)
                .map(|(column, data_type)| {
                    vec![vec![Some(column.to_string()), Some(data_type.to_string())]]
                })
                .unwrap_or_default();
            return Ok(text(&["COLUMN_NAME", "DATA_TYPE"], rows));
        }
        if sql.starts_with("SELECT PARTITION_NAME") {
            let rows = self
                .schema_table(sql)
                .map(|t| t.partitions.iter().map(|p| vec![Some(p.to_string())]).collect())
                .unwrap_or_default();
            return Ok(text(&["PARTITION_NAME"], rows));
        }
        if let Some(caps) = captures(r"^SHOW CREATE DATABASE `([^`]+)`$", sql) {
            return Ok(text(
                &["Database", "Create Database"],
                vec![vec![
                    Some(caps[0].clone()),
                    Some(format!("CREATE DATABASE `{}`", caps[0])),
                ]],
            ));
        }
        if let Some(caps) = captures(r"^SHOW CREATE (TABLE|VIEW) `([^`]+)`\.`([^`]+)`$", sql) {
            let create = format!("CREATE {} `{}`", caps[0], caps[2]);
            return Ok(text(
                &[caps[0].as_str(), "Create"],
                vec![vec![Some(caps[2].clone()), Some(create)]],
            ));
        }
        if sql == "SHOW MASTER STATUS" {
            return Ok(text(
                &["File", "Position", "Binlog_Do_DB", "Binlog_Ignore_DB", "Executed_Gtid_Set"],
                vec![vec![
                    Some("mysql-bin.000003".into()),
                    Some("154".into()),
                    Some(String::new()),
                    Some(String::new()),
                    Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-100".into()),
                ]],
            ));
        }
        if sql == "SELECT @@default_master_connection" {
            return Err(anyhow!("Unknown system variable 'default_master_connection'"));
        }
        if sql == "SHOW SLAVE STATUS"
            || sql.starts_with("SHOW TRIGGERS")
            || sql.starts_with("SHOW PROCEDURE STATUS")
            || sql.starts_with("SHOW FUNCTION STATUS")
            || sql.starts_with("SHOW EVENTS")
        {
            return Ok(ResultSet::default());
        }
        if let Some(caps) = captures(r"^SELECT (MIN|MAX)\(`[^`]+`\) FROM `([^`]+)`\.`([^`]+)`", sql) {
            return self.bound(&caps[0], &caps[1], &caps[2]);
        }
        if let Some(caps) = captures(r"^CHECKSUM TABLE `([^`]+)`\.`([^`]+)`$", sql) {
            return Ok(text(
                &["Table", "Checksum"],
                vec![vec![
                    Some(format!("{}.{}", caps[0], caps[1])),
                    Some("2085240135".into()),
                ]],
            ));
        }
        if let Some(caps) = captures(r"^SELECT `[^`]+` FROM `([^`]+)`\.`([^`]+)` WHERE ", sql) {
            return self.nth_key(&caps[0], &caps[1], sql);
        }
        if sql.starts_with(DATA_PREFIX) {
            return self.select_rows(sql);
        }
        Err(anyhow!("Fake server does not understand: {}", sql))
    }

    fn table_listing(&self, sql: &str) -> ResultSet {
        let schema = captures(r"TABLE_SCHEMA='([^']*)'", sql).map(|c| c[0].clone());
        let name = captures(r"TABLE_NAME='([^']*)'", sql).map(|c| c[0].clone());
        let rows = self
            .tables
            .iter()
            .filter(|t| schema.as_deref() == Some(t.database))
            .filter(|t| name.as_deref().map_or(true, |n| n == t.name))
            .map(|t| {
                let is_view = t.table_type == "VIEW";
                vec![
                    Some(t.name.to_string()),
                    t.engine.map(str::to_string),
                    Some(t.table_type.to_string()),
                    (!is_view).then(|| "utf8mb4_general_ci".to_string()),
                    (!is_view).then(|| t.rows.len().to_string()),
                    (!is_view).then(|| "16384".to_string()),
                ]
            })
            .collect();
        text(
            &[
                "TABLE_NAME",
                "ENGINE",
                "TABLE_TYPE",
                "TABLE_COLLATION",
                "TABLE_ROWS",
                "DATA_LENGTH",
            ],
            rows,
        )
    }

    /// The table an INFORMATION_SCHEMA query is about
    fn schema_table(&self, sql: &str) -> Option<&FakeTable> {
        let caps = captures(r"TABLE_SCHEMA='([^']*)' AND \w*\.?TABLE_NAME='([^']*)'", sql)?;
        self.table(&caps[0], &caps[1])
    }

    fn bound(&self, function: &str, database: &str, name: &str) -> Result<ResultSet> {
        let table = self
            .table(database, name)
            .ok_or_else(|| anyhow!("Table '{}.{}' doesn't exist", database, name))?;
        let value = if table.textual_key() {
            let keys = table.rows.iter().filter_map(|row| row.first().cloned().flatten());
            if function == "MIN" { keys.min() } else { keys.max() }
        } else {
            let keys = table.rows.iter().filter_map(|row| key_of(row));
            let value = if function == "MIN" { keys.min() } else { keys.max() };
            value.map(|v| v.to_string())
        };
        Ok(text(
            &[format!("{}(`id`)", function).as_str()],
            vec![vec![value]],
        ))
    }

    /// The string key `OFFSET n` rows into `(lower, upper]`, in byte order
    fn nth_key(&self, database: &str, name: &str, sql: &str) -> Result<ResultSet> {
        let table = self
            .table(database, name)
            .ok_or_else(|| anyhow!("Table '{}.{}' doesn't exist", database, name))?;
        let lower = captures(r"`[^`]+` > '([^']*)'", sql).map(|c| c[0].clone());
        let upper = captures(r"`[^`]+` <= '([^']*)'", sql)
            .map(|c| c[0].clone())
            .ok_or_else(|| anyhow!("Key lookup without an upper bound: {}", sql))?;
        let offset: usize = captures(r"OFFSET (\d+)$", sql)
            .map(|c| c[0].parse().unwrap())
            .unwrap_or(0);

        let mut keys: Vec<String> = table
            .rows
            .iter()
            .filter_map(|row| row.first().cloned().flatten())
            .filter(|key| lower.as_ref().map_or(true, |lower| key > lower) && *key <= upper)
            .collect();
        keys.sort();
        let rows = keys.into_iter().nth(offset).map(|key| vec![Some(key)]);
        Ok(text(&["id"], rows.into_iter().collect()))
    }

    fn select_rows(&self, sql: &str) -> Result<ResultSet> {
        let caps = captures(r"FROM `([^`]+)`\.`([^`]+)`", sql)
            .ok_or_else(|| anyhow!("Unparsable data query: {}", sql))?;
        let table = self
            .table(&caps[0], &caps[1])
            .ok_or_else(|| anyhow!("Table '{}.{}' doesn't exist", caps[0], caps[1]))?;
        let filter = sql.split_once(" WHERE ").map(|(_, w)| w.to_string());
        let partition = captures(r" PARTITION \(`([^`]+)`\)", sql).map(|c| c[0].clone());
        let textual = table.textual_key();

        let rows = table
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| match &partition {
                Some(partition) => table.partitions[i % table.partitions.len()] == partition.as_str(),
                None => true,
            })
            .filter(|(_, row)| match &filter {
                Some(predicate) => {
                    let key = row.first().and_then(|key| key.as_deref());
                    matches_window(predicate, key, textual)
                }
                None => true,
            })
            .map(|(_, row)| row.clone())
            .collect();
        Ok(text(&table.columns, rows))
    }
}

pub const DATA_PREFIX: &str = "SELECT /*!40001 SQL_NO_CACHE */";

fn text(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> ResultSet {
    ResultSet::from_text(columns, rows)
}

fn key_of(row: &[Option<String>]) -> Option<i128> {
    row.first()?.as_deref()?.parse().ok()
}

/// Evaluate the key-range windows the integer and string chunkers generate
fn matches_window(predicate: &str, key: Option<&str>, textual: bool) -> bool {
    let Some(key) = key else {
        return predicate.contains("IS NULL");
    };
    if textual {
        let lower = captures(r"`[^`]+` > '([^']*)'", predicate);
        let Some(upper) = captures(r"`[^`]+` <= '([^']*)'", predicate) else {
            return false;
        };
        return lower.map_or(true, |lower| key > lower[0].as_str()) && key <= upper[0].as_str();
    }
    let Ok(key) = key.parse::<i128>() else {
        return false;
    };
    if let Some(caps) = captures(r"(-?\d+) < `[^`]+` AND `[^`]+` <= (-?\d+)", predicate) {
        let (lower, upper): (i128, i128) = (parse(&caps[0]), parse(&caps[1]));
        return lower < key && key <= upper;
    }
    if let Some(caps) = captures(r"`[^`]+` = (-?\d+)", predicate) {
        return key == parse(&caps[0]);
    }
    false
}

fn parse(value: &str) -> i128 {
    value.parse().unwrap()
}

/// Capture groups of the first match, without the whole-match group
fn captures(pattern: &str, haystack: &str) -> Option<Vec<String>> {
    static CACHE: std::sync::LazyLock<Mutex<std::collections::HashMap<String, Regex>>> =
        std::sync::LazyLock::new(Default::default);
    let re = CACHE
        .lock()
        .entry(pattern.to_string())
        .or_insert_with(|| Regex::new(pattern).unwrap())
        .clone();
    let caps = re.captures(haystack)?;
    Some(
        caps.iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
    )
}

pub struct FakeConnector {
    server: Arc<FakeServer>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeSession;

    async fn connect(&self) -> Result<FakeSession> {
        Ok(FakeSession {
            id: self.server.next_session.fetch_add(1, Ordering::SeqCst),
            server: self.server.clone(),
        })
    }
}

pub struct FakeSession {
    id: u64,
    server: Arc<FakeServer>,
}

#[async_trait]
impl DumpConnection for FakeSession {
    async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        self.server.respond(self.id, sql)
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.server.log.lock().push(LoggedStatement {
            session: self.id,
            sql: sql.to_string(),
        });
        Ok(())
    }

    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

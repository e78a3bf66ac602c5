// ABOUTME: Turns query results into dump files: data chunks, schema statements and metadata
// ABOUTME: Every file goes through the context's sink so incomplete files never appear

use crate::catalog::{Database, DbTable};
use crate::connection::{DumpConnection, ResultSet, Row, RowConsumer};
use crate::context::DumpContext;
use crate::sink::SinkFile;
use crate::utils::{escape_string, qualified_name, quote_ident, sql_literal, unix_timestamp};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Rows selected by one data chunk
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkQuery {
    predicate: Option<String>,
    partition: Option<String>,
}

impl ChunkQuery {
    pub fn whole_table() -> Self {
        Self::default()
    }

    /// Rows matching a key-range predicate
    pub fn with_predicate(predicate: String) -> Self {
        Self {
            predicate: Some(predicate),
            partition: None,
        }
    }

    /// Rows of a single physical partition
    pub fn partition(name: &str) -> Self {
        Self {
            predicate: None,
            partition: Some(name.to_string()),
        }
    }

    /// The `SELECT` dumping these rows
    pub fn to_sql(&self, table: &DbTable, where_clause: Option<&str>, order_by_primary: bool) -> String {
        let projection = match &table.columns {
            Some(columns) => columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            None => "*".to_string(),
        };

        let mut sql = format!(
            "SELECT /*!40001 SQL_NO_CACHE */ {} FROM {}",
            projection,
            table.qualified()
        );
        if let Some(partition) = &self.partition {
            let _ = write!(sql, " PARTITION ({})", quote_ident(partition));
        }

        let conditions: Vec<String> = where_clause
            .into_iter()
            .chain(self.predicate.as_deref())
            .map(|condition| format!("({})", condition))
            .collect();
        if !conditions.is_empty() {
            let _ = write!(sql, " WHERE {}", conditions.join(" AND "));
        }

        if order_by_primary && !table.primary_key.is_empty() {
            let keys: Vec<String> = table.primary_key.iter().map(|k| quote_ident(k)).collect();
            let _ = write!(sql, " ORDER BY {}", keys.join(", "));
        }
        sql
    }
}

/// Dump the rows selected by `query` into the table's next data file
///
/// Rows are written as they arrive from the server. Returns the number of
/// rows written. Empty chunks leave no file behind and take no file number
/// unless `build_empty_files` is set.
pub async fn write_chunk<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    table: &Arc<DbTable>,
    query: &ChunkQuery,
) -> Result<u64> {
    let sql = query.to_sql(
        table,
        ctx.options.where_clause.as_deref(),
        ctx.options.order_by_primary,
    );
    let started = Instant::now();
    let mut writer = ChunkWriter::new(ctx, table);
    let rows = match conn.stream(&sql, &mut writer).await {
        Ok(rows) => rows,
        Err(e) => {
            writer.abandon();
            return Err(e.context(format!("Failed to dump rows of {}", table.qualified())));
        }
    };

    let Some((name, path)) = writer.finish()? else {
        tracing::debug!("Empty chunk of {} skipped", table.qualified());
        return Ok(0);
    };
    table.record_chunk(rows);
    ctx.record_file(path);
    tracing::debug!(
        "Dumped {} rows of {} into {} in {:?}",
        rows,
        table.qualified(),
        name,
        started.elapsed()
    );
    Ok(rows)
}

/// Streams one chunk's rows into its data file
///
/// The file is opened, and its number taken, when the first row arrives.
struct ChunkWriter<'a> {
    ctx: &'a DumpContext,
    table: &'a DbTable,
    batcher: InsertBatcher,
    file: Option<(String, Box<dyn SinkFile>)>,
}

impl<'a> ChunkWriter<'a> {
    fn new(ctx: &'a DumpContext, table: &'a DbTable) -> Self {
        Self {
            ctx,
            table,
            batcher: InsertBatcher::new(insert_prefix(table), ctx.options.statement_size),
            file: None,
        }
    }

    fn file(&mut self) -> Result<&mut Box<dyn SinkFile>> {
        let open = match self.file.take() {
            Some(open) => open,
            None => {
                let name = self.table.next_chunk_file();
                let mut file = self.ctx.sink.open(&name)?;
                file.write_all(data_file_header(self.table).as_bytes())?;
                (name, file)
            }
        };
        let (_, file) = self.file.insert(open);
        Ok(file)
    }

    /// Publish the file; `None` when no rows arrived and empty files are not kept
    fn finish(mut self) -> Result<Option<(String, PathBuf)>> {
        if self.file.is_none() && !self.ctx.options.build_empty_files {
            return Ok(None);
        }
        let tail = std::mem::take(&mut self.batcher).finish();
        let file = self.file()?;
        if let Some(statement) = tail {
            file.write_all(statement.as_bytes())?;
        }
        match self.file.take() {
            Some((name, file)) => Ok(Some((name, file.finish()?))),
            None => Ok(None),
        }
    }

    fn abandon(mut self) {
        if let Some((name, file)) = self.file.take() {
            if let Err(e) = file.discard() {
                tracing::warn!("Failed to discard partial chunk {}: {:#}", name, e);
            }
        }
    }
}

impl RowConsumer for ChunkWriter<'_> {
    fn row(&mut self, row: Row) -> Result<()> {
        let full = self.batcher.push(&row);
        let file = self.file()?;
        if let Some(statement) = full {
            file.write_all(statement.as_bytes())?;
        }
        Ok(())
    }
}

fn data_file_header(table: &DbTable) -> String {
    format!(
        "/*!40101 SET NAMES {}*/;\n/*!40014 SET FOREIGN_KEY_CHECKS=0*/;\n/*!40103 SET TIME_ZONE='+00:00' */;\n",
        table.charset.as_deref().unwrap_or("binary")
    )
}

/// Tables dumped with an explicit projection name their columns
fn insert_prefix(table: &DbTable) -> String {
    let target = quote_ident(&table.name);
    match &table.columns {
        Some(columns) if !columns.is_empty() => {
            let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            format!("INSERT INTO {} ({}) VALUES ", target, columns.join(", "))
        }
        _ => format!("INSERT INTO {} VALUES ", target),
    }
}

/// Batches rows into `INSERT` statements of at most `statement_size` bytes
///
/// A single row larger than the limit still gets a statement of its own.
#[derive(Debug, Default)]
pub struct InsertBatcher {
    prefix: String,
    statement_size: usize,
    current: String,
}

impl InsertBatcher {
    pub fn new(prefix: String, statement_size: usize) -> Self {
        Self {
            prefix,
            statement_size,
            current: String::new(),
        }
    }

    /// Add a row, returning the previous statement once the row no longer fits in it
    pub fn push(&mut self, row: &[Option<Vec<u8>>]) -> Option<String> {
        let values: Vec<String> = row
            .iter()
            .map(|cell| match cell {
                Some(bytes) => sql_literal(bytes),
                None => "NULL".to_string(),
            })
            .collect();
        let tuple = format!("({})", values.join(","));

        let mut full = None;
        if !self.current.is_empty() && self.current.len() + tuple.len() + 2 > self.statement_size {
            self.current.push_str(";\n");
            full = Some(std::mem::take(&mut self.current));
        }
        if self.current.is_empty() {
            self.current.push_str(&self.prefix);
        } else {
            self.current.push(',');
        }
        self.current.push_str(&tuple);
        full
    }

    /// The statement still being filled, if any
    pub fn finish(mut self) -> Option<String> {
        if self.current.is_empty() {
            return None;
        }
        self.current.push_str(";\n");
        Some(self.current)
    }
}

fn write_file(ctx: &DumpContext, name: &str, contents: &str) -> Result<PathBuf> {
    let mut file = ctx.sink.open(name)?;
    file.write_all(contents.as_bytes())?;
    let path = file.finish()?;
    ctx.record_file(path.clone());
    Ok(path)
}

/// Column `index` of the first row, failing with a message naming `what`
fn first_row_text(result: &ResultSet, index: usize, what: &str) -> Result<String> {
    result
        .text(0, index)
        .map(str::to_string)
        .with_context(|| format!("Server returned no definition for {}", what))
}

pub async fn write_database_schema<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    database: &Database,
) -> Result<()> {
    let result = conn
        .query(&format!("SHOW CREATE DATABASE {}", database.escaped))
        .await
        .with_context(|| format!("Failed to show create database {}", database.name))?;
    let create = first_row_text(&result, 1, &database.name)?;
    write_file(
        ctx,
        &format!("{}-schema-create.sql", database.name),
        &format!("{};\n", create),
    )?;
    Ok(())
}

pub async fn write_table_schema<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    table: &DbTable,
) -> Result<()> {
    let result = conn
        .query(&format!("SHOW CREATE TABLE {}", table.qualified()))
        .await
        .with_context(|| format!("Failed to show create table {}", table.qualified()))?;
    let create = first_row_text(&result, 1, &table.display_name())?;
    let contents = format!(
        "/*!40101 SET NAMES binary*/;\n/*!40014 SET FOREIGN_KEY_CHECKS=0*/;\n\n{};\n",
        create
    );
    write_file(ctx, &format!("{}-schema.sql", table.display_name()), &contents)?;
    Ok(())
}

pub async fn write_view_schema<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    table: &DbTable,
) -> Result<()> {
    let result = conn
        .query(&format!("SHOW CREATE VIEW {}", table.qualified()))
        .await
        .with_context(|| format!("Failed to show create view {}", table.qualified()))?;
    let create = first_row_text(&result, 1, &table.display_name())?;
    let target = quote_ident(&table.name);
    let contents = format!(
        "/*!40101 SET NAMES binary*/;\nDROP TABLE IF EXISTS {};\nDROP VIEW IF EXISTS {};\n{};\n",
        target, target, create
    );
    write_file(
        ctx,
        &format!("{}-schema-view.sql", table.display_name()),
        &contents,
    )?;
    Ok(())
}

pub async fn write_sequence_schema<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    table: &DbTable,
) -> Result<()> {
    let result = conn
        .query(&format!("SHOW CREATE SEQUENCE {}", table.qualified()))
        .await
        .with_context(|| format!("Failed to show create sequence {}", table.qualified()))?;
    let create = first_row_text(&result, 1, &table.display_name())?;

    let next = conn
        .query(&format!(
            "SELECT next_not_cached_value FROM {}",
            table.qualified()
        ))
        .await
        .with_context(|| format!("Failed to read next value of {}", table.qualified()))?;

    let mut contents = format!("/*!40101 SET NAMES binary*/;\n{};\n", create);
    if let Some(value) = next.scalar() {
        let _ = writeln!(
            contents,
            "DO SETVAL({}, {}, 0);",
            quote_ident(&table.name),
            value
        );
    }
    write_file(
        ctx,
        &format!("{}-schema-sequence.sql", table.display_name()),
        &contents,
    )?;
    Ok(())
}

/// Triggers attached to a table; no file is written when there are none
pub async fn write_triggers<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    table: &DbTable,
) -> Result<()> {
    let triggers = conn
        .query(&format!(
            "SHOW TRIGGERS FROM {} LIKE '{}'",
            table.database.escaped,
            escape_string(&table.name)
        ))
        .await
        .with_context(|| format!("Failed to list triggers of {}", table.qualified()))?;

    let mut contents = String::new();
    for row in 0..triggers.len() {
        let Some(name) = triggers
            .text_by_name(row, "Trigger")
            .or_else(|| triggers.text(row, 0))
        else {
            continue;
        };
        let create = conn
            .query(&format!(
                "SHOW CREATE TRIGGER {}",
                qualified_name(&table.database.name, name)
            ))
            .await
            .with_context(|| format!("Failed to show create trigger {}", name))?;
        let statement = create
            .text_by_name(0, "SQL Original Statement")
            .map(str::to_string)
            .map_or_else(|| first_row_text(&create, 2, name), Ok)?;
        let _ = write!(contents, "DELIMITER ;;\n{};;\nDELIMITER ;\n", statement);
    }

    if contents.is_empty() {
        return Ok(());
    }
    write_file(
        ctx,
        &format!("{}-schema-triggers.sql", table.display_name()),
        &format!("/*!40101 SET NAMES binary*/;\n{}", contents),
    )?;
    Ok(())
}

/// Store the server's checksum of a table for the metadata file
pub async fn write_checksum<C: DumpConnection>(conn: &mut C, table: &DbTable) -> Result<()> {
    let result = conn
        .query(&format!("CHECKSUM TABLE {}", table.qualified()))
        .await
        .with_context(|| format!("Failed to checksum {}", table.qualified()))?;
    let checksum = result
        .text_by_name(0, "Checksum")
        .or_else(|| result.text(0, 1))
        .map(str::to_string);
    tracing::debug!("Checksum of {}: {:?}", table.qualified(), checksum);
    table.set_checksum(checksum);
    Ok(())
}

/// Procedures, functions and events of a database that pass the filters
pub async fn write_post_data<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    database: &Database,
) -> Result<()> {
    let mut contents = String::new();

    if ctx.options.routines {
        for kind in ["PROCEDURE", "FUNCTION"] {
            let listing = format!(
                "SHOW {} STATUS WHERE CAST(Db AS BINARY) = '{}'",
                kind,
                escape_string(&database.name)
            );
            // "Create Procedure" / "Create Function" sit in the third column
            append_definitions(ctx, conn, database, &listing, kind, 2, &mut contents).await?;
        }
    }
    if ctx.options.events {
        let listing = format!("SHOW EVENTS FROM {}", database.escaped);
        append_definitions(ctx, conn, database, &listing, "EVENT", 3, &mut contents).await?;
    }

    if contents.is_empty() {
        return Ok(());
    }
    write_file(
        ctx,
        &format!("{}-schema-post.sql", database.name),
        &format!("/*!40101 SET NAMES binary*/;\n{}", contents),
    )?;
    Ok(())
}

async fn append_definitions<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    database: &Database,
    listing: &str,
    kind: &str,
    definition_column: usize,
    contents: &mut String,
) -> Result<()> {
    let objects = conn
        .query(listing)
        .await
        .with_context(|| format!("Failed to list {} objects of {}", kind, database.name))?;

    for row in 0..objects.len() {
        let Some(name) = objects
            .text_by_name(row, "Name")
            .or_else(|| objects.text(row, 1))
        else {
            continue;
        };
        if !ctx.filter.should_dump_object(&database.name, name) {
            continue;
        }
        let create = conn
            .query(&format!(
                "SHOW CREATE {} {}",
                kind,
                qualified_name(&database.name, name)
            ))
            .await
            .with_context(|| format!("Failed to show create {} {}", kind, name))?;
        let definition = first_row_text(&create, definition_column, name)?;
        let _ = write!(
            contents,
            "DROP {} IF EXISTS {};\nDELIMITER ;;\n{};;\nDELIMITER ;\n",
            kind,
            quote_ident(name),
            definition
        );
    }
    Ok(())
}

/// Binary log and replica positions of the snapshot, in metadata-file form
pub async fn capture_snapshot_info<C: DumpConnection>(conn: &mut C) -> Result<String> {
    let mut info = String::new();

    let master = conn
        .query("SHOW MASTER STATUS")
        .await
        .context("Failed to read master status")?;
    if let Some(file) = master.text(0, 0) {
        let position = master.text(0, 1).unwrap_or_default();
        let gtid = match master
            .text_by_name(0, "Executed_Gtid_Set")
            .or_else(|| master.text(0, 4))
        {
            Some(gtid) => Some(gtid.to_string()),
            None => conn
                .query("SELECT @@gtid_binlog_pos")
                .await
                .ok()
                .and_then(|r| r.scalar().map(str::to_string)),
        };
        let _ = write!(
            info,
            "[master]\nFile = {}\nPosition = {}\nExecuted_Gtid_Set = {}\n\n",
            file,
            position,
            gtid.unwrap_or_default()
        );
        tracing::info!("Written master status");
    }

    let multisource = conn
        .query("SELECT @@default_master_connection")
        .await
        .map(|r| !r.is_empty())
        .unwrap_or(false);
    if multisource {
        tracing::info!("Multisource replica detected");
    }
    let replicas = conn
        .query(if multisource {
            "SHOW ALL SLAVES STATUS"
        } else {
            "SHOW SLAVE STATUS"
        })
        .await
        .context("Failed to read replica status")?;

    let mut replica_count = 0;
    for row in 0..replicas.len() {
        if replicas.text_by_name(row, "Master_Host").is_none() {
            continue;
        }
        replica_count += 1;

        let channel = replicas
            .text_by_name(row, "Channel_Name")
            .or_else(|| replicas.text_by_name(row, "Connection_name"))
            .filter(|channel| !channel.is_empty());
        match channel {
            Some(channel) => {
                let _ = writeln!(info, "[replication.{}]", channel);
            }
            None => info.push_str("[replication]\n"),
        }
        let (gtid_title, gtid) = match replicas.text_by_name(row, "Executed_Gtid_Set") {
            Some(gtid) => ("Executed_Gtid_Set", Some(gtid)),
            None => ("Gtid_Slave_Pos", replicas.text_by_name(row, "Gtid_Slave_Pos")),
        };
        let _ = write!(
            info,
            "relay_master_log_file = '{}'\nexec_master_log_pos = {}\n{} = {}\n\n",
            replicas
                .text_by_name(row, "Relay_Master_Log_File")
                .unwrap_or_default(),
            replicas
                .text_by_name(row, "Exec_Master_Log_Pos")
                .unwrap_or_default(),
            gtid_title,
            gtid.unwrap_or_default()
        );
        tracing::info!("Written replica status");
    }
    if replica_count > 1 {
        tracing::warn!(
            "Multisource replication found. Do not trust exec_master_log_pos as it might cause data inconsistencies"
        );
    }

    Ok(info)
}

/// Final summary of the dump
pub fn write_metadata(ctx: &DumpContext, started_at: u64) -> Result<PathBuf> {
    let mut contents = format!("Started dump at: {}\n", started_at);
    if let Some(snapshot) = ctx.snapshot_info() {
        contents.push_str(&snapshot);
    }

    for table in ctx.catalog.tables() {
        if !table.has_data() {
            continue;
        }
        let _ = write!(
            contents,
            "\n# {}\nrows = {}\n",
            table.qualified(),
            table.rows_dumped()
        );
        if let Some(checksum) = table.checksum() {
            let _ = writeln!(contents, "data_checksum = {}", checksum);
        }
    }

    let _ = writeln!(contents, "\nFinished dump at: {}", unix_timestamp());
    let mut file = ctx.sink.open("metadata")?;
    file.write_all(contents.as_bytes())?;
    file.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableInfo;

    fn table(columns: Option<Vec<&str>>, primary_key: Vec<&str>) -> DbTable {
        DbTable::new(
            Arc::new(Database::new("shop")),
            "orders",
            TableInfo {
                columns: columns.map(|c| c.into_iter().map(String::from).collect()),
                primary_key: primary_key.into_iter().map(String::from).collect(),
                ..Default::default()
            },
        )
    }

    fn rows(values: &[&[Option<&str>]]) -> ResultSet {
        ResultSet::from_text(
            &["id", "note"],
            values
                .iter()
                .map(|row| row.iter().map(|v| v.map(String::from)).collect())
                .collect(),
        )
    }

    #[test]
    fn test_whole_table_query() {
        let t = table(None, vec![]);
        assert_eq!(
            ChunkQuery::whole_table().to_sql(&t, None, false),
            "SELECT /*!40001 SQL_NO_CACHE */ * FROM `shop`.`orders`"
        );
    }

    #[test]
    fn test_predicate_is_combined_with_global_where() {
        let t = table(Some(vec!["id", "note"]), vec!["id"]);
        let query = ChunkQuery::with_predicate("0 < `id` AND `id` <= 1000".into());
        assert_eq!(
            query.to_sql(&t, Some("note <> ''"), true),
            "SELECT /*!40001 SQL_NO_CACHE */ `id`, `note` FROM `shop`.`orders` \
             WHERE (note <> '') AND (0 < `id` AND `id` <= 1000) ORDER BY `id`"
        );
    }

    #[test]
    fn test_partition_query() {
        let t = table(None, vec!["id"]);
        assert_eq!(
            ChunkQuery::partition("p2024").to_sql(&t, None, false),
            "SELECT /*!40001 SQL_NO_CACHE */ * FROM `shop`.`orders` PARTITION (`p2024`)"
        );
    }

    fn render(prefix: &str, result: &ResultSet, statement_size: usize) -> Vec<String> {
        let mut batcher = InsertBatcher::new(prefix.to_string(), statement_size);
        let mut statements: Vec<String> = result
            .rows
            .iter()
            .filter_map(|row| batcher.push(row))
            .collect();
        statements.extend(batcher.finish());
        statements
    }

    #[test]
    fn test_inserts_render_nulls_and_escape_strings() {
        let result = rows(&[&[Some("1"), Some("it's")], &[Some("2"), None]]);
        let statements = render("INSERT INTO `orders` VALUES ", &result, 1_000_000);
        assert_eq!(
            statements,
            vec!["INSERT INTO `orders` VALUES ('1','it\\'s'),('2',NULL);\n"]
        );
    }

    #[test]
    fn test_inserts_split_at_statement_size() {
        let result = rows(&[
            &[Some("1"), Some("a")],
            &[Some("2"), Some("b")],
            &[Some("3"), Some("c")],
        ]);
        let prefix = "INSERT INTO `orders` VALUES ";
        let statements = render(prefix, &result, prefix.len() + 20);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("('1','a'),('2','b');\n"));
        assert_eq!(statements[1], format!("{}('3','c');\n", prefix));
    }

    #[test]
    fn test_oversized_row_gets_its_own_statement() {
        let result = rows(&[&[Some("1"), Some("a long note")], &[Some("2"), Some("b")]]);
        let statements = render("INSERT INTO `orders` VALUES ", &result, 10);
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_no_rows_no_statements() {
        assert!(render("INSERT INTO `orders` VALUES ", &rows(&[]), 100).is_empty());
    }

    #[test]
    fn test_complete_insert_lists_columns() {
        let t = table(Some(vec!["id", "note"]), vec![]);
        assert_eq!(
            insert_prefix(&t),
            "INSERT INTO `orders` (`id`, `note`) VALUES "
        );
        let t = table(None, vec![]);
        assert_eq!(insert_prefix(&t), "INSERT INTO `orders` VALUES ");
    }
}

// ABOUTME: Schema introspection that fills the catalog and fans out per-table jobs
// ABOUTME: Runs as discovery-queue jobs on the workers' own snapshot sessions

use super::{Database, DbTable, TableInfo, TableKind};
use crate::connection::{DumpConnection, ResultSet};
use crate::context::DumpContext;
use crate::error::{is_fatal, DumpError};
use crate::jobs::{Job, SchemaJob};
use crate::utils::escape_string;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// One row of the table listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableListing {
    pub name: String,
    /// `None` for views and for broken tables
    pub engine: Option<String>,
    pub table_type: String,
    pub collation: Option<String>,
    pub rows: u64,
    pub data_length: u64,
}

impl TableListing {
    pub fn is_view(&self) -> bool {
        self.table_type.eq_ignore_ascii_case("VIEW")
    }

    pub fn is_sequence(&self) -> bool {
        self.table_type.eq_ignore_ascii_case("SEQUENCE")
    }

    fn from_row(result: &ResultSet, row: usize) -> Option<Self> {
        let number = |column: &str| {
            result
                .text_by_name(row, column)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        Some(Self {
            name: result.text_by_name(row, "TABLE_NAME")?.to_string(),
            engine: result.text_by_name(row, "ENGINE").map(str::to_string),
            table_type: result
                .text_by_name(row, "TABLE_TYPE")
                .unwrap_or("BASE TABLE")
                .to_string(),
            collation: result.text_by_name(row, "TABLE_COLLATION").map(str::to_string),
            rows: number("TABLE_ROWS"),
            data_length: number("DATA_LENGTH"),
        })
    }
}

fn table_listing_query(database: &str, table: Option<&str>) -> String {
    let mut sql = format!(
        "SELECT TABLE_NAME, ENGINE, TABLE_TYPE, TABLE_COLLATION, TABLE_ROWS, DATA_LENGTH \
         FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA='{}'",
        escape_string(database)
    );
    if let Some(table) = table {
        sql.push_str(&format!(" AND TABLE_NAME='{}'", escape_string(table)));
    }
    sql
}

async fn list_tables<C: DumpConnection>(
    conn: &mut C,
    database: &str,
    table: Option<&str>,
) -> Result<Vec<TableListing>> {
    let result = conn
        .query(&table_listing_query(database, table))
        .await
        .with_context(|| format!("Failed to list tables of {}", database))?;
    Ok((0..result.len())
        .filter_map(|row| TableListing::from_row(&result, row))
        .collect())
}

/// Enqueue a discovery job per database the filters allow
pub async fn discover_all_databases<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
) -> Result<()> {
    let databases = conn
        .query("SHOW DATABASES")
        .await
        .context("Unable to list databases")?;

    for row in 0..databases.len() {
        let Some(name) = databases.text(row, 0) else {
            continue;
        };
        if !ctx.filter.should_dump_database(name) {
            tracing::debug!("Skipping database {}", name);
            continue;
        }
        let database = ctx.catalog.database(name);
        ctx.pipeline.discovery_jobs.begin();
        ctx.pipeline
            .discovery
            .push(Job::DiscoverDatabase(database))
            .await;
    }
    Ok(())
}

/// Discover every table, view and sequence of one database
pub async fn discover_database<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    database: &Arc<Database>,
) -> Result<()> {
    tracing::info!("Dumping db information for {}", database.escaped);
    if !ctx.options.no_schemas && database.claim_schema_job() {
        ctx.pipeline
            .schema
            .push(Job::DumpSchema(SchemaJob::CreateDatabase(database.clone())))
            .await;
    }

    for listing in list_tables(conn, &database.name, None).await? {
        if is_selected(ctx, database, &listing)? {
            add_table(ctx, conn, database, &listing).await?;
        }
    }

    if elected_for_post_data(ctx, conn, database).await? {
        ctx.pipeline
            .post_data
            .push(Job::DumpPostData(database.clone()))
            .await;
    }
    Ok(())
}

/// Discover only the listed `db.table` entries
pub async fn discover_table_list<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    tables: &[String],
) -> Result<()> {
    for entry in tables {
        let Some((db_name, table_name)) = entry.split_once('.') else {
            tracing::warn!("Ignoring table list entry without a database: {}", entry);
            continue;
        };
        let database = ctx.catalog.database(db_name);
        if !ctx.options.no_schemas && database.claim_schema_job() {
            ctx.pipeline
                .schema
                .push(Job::DumpSchema(SchemaJob::CreateDatabase(database.clone())))
                .await;
        }

        let listings = list_tables(conn, db_name, Some(table_name)).await?;
        if listings.is_empty() {
            tracing::warn!("Table {} not found", entry);
        }
        for listing in listings {
            if is_selected(ctx, &database, &listing)? {
                add_table(ctx, conn, &database, &listing).await?;
            }
        }
    }
    Ok(())
}

/// Register one selected table; a failed table is counted and skipped
async fn add_table<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    database: &Arc<Database>,
    listing: &TableListing,
) -> Result<()> {
    match new_table_to_dump(ctx, conn, database, listing).await {
        Ok(()) => Ok(()),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            tracing::error!("Skipping {}.{}: {:#}", database.name, listing.name, e);
            ctx.record_error();
            Ok(())
        }
    }
}

/// Apply engine, kind and name filters to one listed table
fn is_selected(ctx: &DumpContext, database: &Database, listing: &TableListing) -> Result<bool> {
    let is_view = listing.is_view();
    let is_sequence = listing.is_sequence();

    if !is_view && !is_sequence {
        let Some(engine) = &listing.engine else {
            tracing::warn!(
                "Broken table detected, please review: {}.{}",
                database.name,
                listing.name
            );
            if ctx.options.exit_on_broken_table {
                return Err(DumpError::BrokenTable {
                    database: database.name.clone(),
                    table: listing.name.clone(),
                }
                .into());
            }
            return Ok(false);
        };
        if ctx
            .options
            .ignore_engines
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(engine))
        {
            tracing::debug!("Ignoring {}.{} with engine {}", database.name, listing.name, engine);
            return Ok(false);
        }
    }

    if (is_view && ctx.options.no_views) || (is_sequence && ctx.options.no_sequences) {
        return Ok(false);
    }
    Ok(ctx.filter.should_dump_table(&database.name, &listing.name))
}

fn is_transactional_engine(engine: &str) -> bool {
    engine.eq_ignore_ascii_case("InnoDB") || engine.eq_ignore_ascii_case("TokuDB")
}

/// Register a table in the catalog and enqueue its jobs
///
/// A table already in the catalog is left alone, so running discovery twice
/// over the same schema yields the same tables and jobs.
pub async fn new_table_to_dump<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    database: &Arc<Database>,
    listing: &TableListing,
) -> Result<()> {
    let options = &ctx.options;
    let kind = if listing.is_sequence() {
        TableKind::Sequence
    } else if listing.is_view() && !options.views_as_tables {
        TableKind::View
    } else {
        TableKind::Base
    };
    let engine = listing.engine.clone().unwrap_or_default();

    let charset = match &listing.collation {
        Some(collation) => ctx.charset_for(conn, collation).await?,
        None => None,
    };

    let mut info = TableInfo {
        kind,
        is_transactional: options.trx_consistency_only || is_transactional_engine(&engine),
        engine,
        rows_estimate: listing.rows,
        data_length: listing.data_length,
        charset,
        ..Default::default()
    };
    if kind == TableKind::Base && !options.no_data {
        info.columns = projection(ctx, conn, &database.name, &listing.name).await?;
        if options.order_by_primary {
            info.primary_key = primary_key(conn, &database.name, &listing.name).await?;
        }
    }

    let (table, added) = ctx
        .catalog
        .add_table(DbTable::new(database.clone(), &listing.name, info));
    if !added {
        tracing::debug!("{} already discovered", table.qualified());
        return Ok(());
    }

    let pipeline = &ctx.pipeline;
    match table.kind {
        TableKind::View => {
            if !options.no_schemas {
                pipeline.post_data.push(Job::DumpView(table.clone())).await;
            }
            return Ok(());
        }
        TableKind::Sequence => {
            if !options.no_schemas {
                pipeline.schema.push(Job::DumpSequence(table.clone())).await;
            }
            return Ok(());
        }
        TableKind::Base => {}
    }

    if !options.no_schemas {
        pipeline
            .schema
            .push(Job::DumpSchema(SchemaJob::Table(table.clone())))
            .await;
    }
    if options.triggers {
        pipeline.post_data.push(Job::DumpTriggers(table.clone())).await;
    }
    if !options.no_data && table.has_data() {
        if options.checksums {
            pipeline.post_data.push(Job::DumpChecksum(table.clone())).await;
        }
        ctx.progress.inc_length(1);
        pipeline
            .schema
            .push(Job::DetermineChunkType(table.clone()))
            .await;
    }
    Ok(())
}

fn is_generated(extra: &str) -> bool {
    let extra = extra.to_ascii_uppercase();
    extra.contains("GENERATED") && !extra.contains("DEFAULT_GENERATED")
}

/// Explicit column list for tables that cannot be dumped with `SELECT *`
///
/// Generated columns cannot be inserted, so tables having any get their
/// insertable columns listed. So does every table under `complete_insert`.
async fn projection<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    database: &str,
    table: &str,
) -> Result<Option<Vec<String>>> {
    let result = conn
        .query(&format!(
            "SELECT COLUMN_NAME, EXTRA FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA='{}' AND TABLE_NAME='{}' ORDER BY ORDINAL_POSITION",
            escape_string(database),
            escape_string(table)
        ))
        .await
        .with_context(|| format!("Failed to read columns of {}.{}", database, table))?;

    let mut insertable = Vec::with_capacity(result.len());
    let mut has_generated = false;
    for row in 0..result.len() {
        let Some(column) = result.text(row, 0) else {
            continue;
        };
        if is_generated(result.text(row, 1).unwrap_or_default()) {
            has_generated = true;
        } else {
            insertable.push(column.to_string());
        }
    }

    let has_generated = has_generated && !ctx.options.ignore_generated_fields;
    Ok((ctx.options.complete_insert || has_generated).then_some(insertable))
}

async fn primary_key<C: DumpConnection>(
    conn: &mut C,
    database: &str,
    table: &str,
) -> Result<Vec<String>> {
    let result = conn
        .query(&format!(
            "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.STATISTICS \
             WHERE TABLE_SCHEMA='{}' AND TABLE_NAME='{}' AND INDEX_NAME='PRIMARY' \
             ORDER BY SEQ_IN_INDEX",
            escape_string(database),
            escape_string(table)
        ))
        .await
        .with_context(|| format!("Failed to read primary key of {}.{}", database, table))?;
    Ok((0..result.len())
        .filter_map(|row| result.text(row, 0).map(str::to_string))
        .collect())
}

/// Whether any routine or event of the database passes the filters
///
/// Stored programs belong to no table, so a single match is enough to dump
/// them all.
async fn elected_for_post_data<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    database: &Database,
) -> Result<bool> {
    let mut listings = Vec::new();
    if ctx.options.routines {
        for kind in ["PROCEDURE", "FUNCTION"] {
            listings.push(format!(
                "SHOW {} STATUS WHERE CAST(Db AS BINARY) = '{}'",
                kind,
                escape_string(&database.name)
            ));
        }
    }
    if ctx.options.events {
        listings.push(format!("SHOW EVENTS FROM {}", database.escaped));
    }

    for listing in listings {
        let objects = conn
            .query(&listing)
            .await
            .with_context(|| format!("Failed to list stored programs of {}", database.name))?;
        let elected = (0..objects.len()).any(|row| {
            objects
                .text_by_name(row, "Name")
                .or_else(|| objects.text(row, 1))
                .is_some_and(|name| ctx.filter.should_dump_object(&database.name, name))
        });
        if elected {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `db.table` names of base tables not updated within the last `days` days
pub async fn not_updated_tables<C: DumpConnection>(
    conn: &mut C,
    days: u32,
) -> Result<HashSet<String>> {
    let result = conn
        .query(&format!(
            "SELECT CONCAT(TABLE_SCHEMA,'.',TABLE_NAME) FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND UPDATE_TIME < NOW() - INTERVAL {} DAY",
            days
        ))
        .await
        .context("Failed to list tables not updated recently")?;
    let tables: HashSet<String> = (0..result.len())
        .filter_map(|row| result.text(row, 0).map(str::to_string))
        .collect();
    tracing::info!("{} table(s) not updated in the last {} day(s)", tables.len(), days);
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(rows: Vec<Vec<Option<&str>>>) -> ResultSet {
        ResultSet::from_text(
            &[
                "TABLE_NAME",
                "ENGINE",
                "TABLE_TYPE",
                "TABLE_COLLATION",
                "TABLE_ROWS",
                "DATA_LENGTH",
            ],
            rows.into_iter()
                .map(|row| row.into_iter().map(|c| c.map(String::from)).collect())
                .collect(),
        )
    }

    #[test]
    fn test_listing_rows_classify_views_and_sequences() {
        let result = listing(vec![
            vec![
                Some("orders"),
                Some("InnoDB"),
                Some("BASE TABLE"),
                Some("utf8mb4_general_ci"),
                Some("1200"),
                Some("65536"),
            ],
            vec![Some("recent"), None, Some("VIEW"), None, None, None],
            vec![Some("ids"), Some("InnoDB"), Some("SEQUENCE"), None, Some("1"), None],
        ]);
        let orders = TableListing::from_row(&result, 0).unwrap();
        assert!(!orders.is_view() && !orders.is_sequence());
        assert_eq!(orders.rows, 1200);
        assert_eq!(orders.data_length, 65536);
        assert_eq!(orders.collation.as_deref(), Some("utf8mb4_general_ci"));

        let recent = TableListing::from_row(&result, 1).unwrap();
        assert!(recent.is_view());
        assert_eq!(recent.engine, None);
        assert_eq!(recent.rows, 0);

        assert!(TableListing::from_row(&result, 2).unwrap().is_sequence());
        assert!(TableListing::from_row(&result, 3).is_none());
    }

    #[test]
    fn test_generated_column_detection() {
        assert!(is_generated("VIRTUAL GENERATED"));
        assert!(is_generated("stored generated"));
        assert!(!is_generated("DEFAULT_GENERATED"));
        assert!(!is_generated("DEFAULT_GENERATED on update CURRENT_TIMESTAMP"));
        assert!(!is_generated("auto_increment"));
    }

    #[test]
    fn test_transactional_engines() {
        assert!(is_transactional_engine("InnoDB"));
        assert!(is_transactional_engine("tokudb"));
        assert!(!is_transactional_engine("MyISAM"));
        assert!(!is_transactional_engine(""));
    }

    #[test]
    fn test_listing_query_escapes_names() {
        assert_eq!(
            table_listing_query("sh'op", Some("orders")),
            "SELECT TABLE_NAME, ENGINE, TABLE_TYPE, TABLE_COLLATION, TABLE_ROWS, DATA_LENGTH \
             FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA='sh\\'op' AND TABLE_NAME='orders'"
        );
    }
}

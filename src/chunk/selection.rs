// ABOUTME: Picks a table's chunk type and seeds its first chunk-step
// ABOUTME: Runs as a schema-stage job so selection overlaps with other discovery work

use super::{ChunkStep, ChunkType, CharStep, IntegerStep, PartitionStep};
use crate::catalog::DbTable;
use crate::connection::DumpConnection;
use crate::context::DumpContext;
use crate::jobs::TableJob;
use crate::utils::escape_string;
use anyhow::{Context, Result};
use std::sync::Arc;

/// First column of the best unique index, with its data type
async fn chunk_key<C: DumpConnection>(
    conn: &mut C,
    table: &DbTable,
) -> Result<Option<(String, String)>> {
    let result = conn
        .query(&format!(
            "SELECT s.COLUMN_NAME, c.DATA_TYPE FROM INFORMATION_SCHEMA.STATISTICS s \
             JOIN INFORMATION_SCHEMA.COLUMNS c ON c.TABLE_SCHEMA = s.TABLE_SCHEMA \
             AND c.TABLE_NAME = s.TABLE_NAME AND c.COLUMN_NAME = s.COLUMN_NAME \
             WHERE s.TABLE_SCHEMA='{}' AND s.TABLE_NAME='{}' AND s.NON_UNIQUE = 0 \
             AND s.SEQ_IN_INDEX = 1 \
             ORDER BY s.INDEX_NAME = 'PRIMARY' DESC, s.INDEX_NAME",
            escape_string(&table.database.name),
            escape_string(&table.name)
        ))
        .await
        .with_context(|| format!("Failed to find a chunk key for {}", table.qualified()))?;

    Ok(result.text(0, 0).map(|column| {
        (
            column.to_string(),
            result.text(0, 1).unwrap_or_default().to_ascii_lowercase(),
        )
    }))
}

async fn partitions<C: DumpConnection>(conn: &mut C, table: &DbTable) -> Result<Vec<String>> {
    let result = conn
        .query(&format!(
            "SELECT PARTITION_NAME FROM INFORMATION_SCHEMA.PARTITIONS \
             WHERE PARTITION_NAME IS NOT NULL AND TABLE_SCHEMA='{}' AND TABLE_NAME='{}' \
             ORDER BY PARTITION_ORDINAL_POSITION",
            escape_string(&table.database.name),
            escape_string(&table.name)
        ))
        .await
        .with_context(|| format!("Failed to list partitions of {}", table.qualified()))?;
    Ok((0..result.len())
        .filter_map(|row| result.text(row, 0).map(str::to_string))
        .collect())
}

/// Chunk type implied by a key column's data type
pub fn chunk_type_for(data_type: &str) -> ChunkType {
    match data_type {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => ChunkType::Integer,
        "char" | "varchar" => ChunkType::Char,
        _ => ChunkType::None,
    }
}

/// Decide how `table` is split and enqueue its first data job
pub async fn determine_chunk_type<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    table: &Arc<DbTable>,
) -> Result<()> {
    let step = match ctx.sizer {
        Some(sizer) if table.has_data() => {
            let key = chunk_key(conn, table).await?;
            let keyed = key.and_then(|(field, data_type)| match chunk_type_for(&data_type) {
                ChunkType::Integer => Some(ChunkStep::Integer(IntegerStep::new(&field, sizer))),
                ChunkType::Char => Some(ChunkStep::Char(CharStep::new(&field, sizer))),
                _ => None,
            });
            match keyed {
                Some(step) => Some(step),
                None => {
                    let names = partitions(conn, table).await?;
                    (!names.is_empty()).then(|| ChunkStep::Partition(PartitionStep::new(names)))
                }
            }
        }
        _ => None,
    };

    let chunk_type = step.as_ref().map_or(ChunkType::None, ChunkStep::chunk_type);
    table.set_chunk_type(chunk_type);
    tracing::debug!("{} is dumped with chunk type {}", table.qualified(), chunk_type);

    let (queue, pool) = ctx.pipeline.stage_for(table);
    let step = step.map(Arc::new);
    if let Some(step) = &step {
        table.add_step(step.clone());
        pool.add(table.clone());
    }
    queue.push(TableJob::new(table.clone(), step).into_job()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_keys_chunk_by_integer() {
        for data_type in ["tinyint", "smallint", "mediumint", "int", "bigint"] {
            assert_eq!(chunk_type_for(data_type), ChunkType::Integer);
        }
    }

    #[test]
    fn test_string_keys_chunk_by_char() {
        assert_eq!(chunk_type_for("varchar"), ChunkType::Char);
        assert_eq!(chunk_type_for("char"), ChunkType::Char);
    }

    #[test]
    fn test_other_keys_are_not_chunked() {
        for data_type in ["decimal", "datetime", "binary", "text", ""] {
            assert_eq!(chunk_type_for(data_type), ChunkType::None);
        }
    }
}

// ABOUTME: Database session abstraction used by every worker and the coordinator
// ABOUTME: Defines the query capability, result sets and the session factory

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Rows returned by a query, addressed by column name or position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// One result row: raw cell bytes, `None` for SQL NULL
pub type Row = Vec<Option<Vec<u8>>>;

/// Receives the rows of a streamed query as they arrive
pub trait RowConsumer: Send {
    fn row(&mut self, row: Row) -> Result<()>;
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Build a result set from textual cells, mostly useful for stand-in servers
    pub fn from_text(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|c| c.map(String::into_bytes)).collect())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Case-insensitive column lookup
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    /// Text value of a cell, `None` for SQL NULL or an out-of-range index
    pub fn text(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)?
            .get(column)?
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Text value of a named column
    pub fn text_by_name(&self, row: usize, column: &str) -> Option<&str> {
        self.text(row, self.column_index(column)?)
    }

    /// First cell of the first row, the common shape of scalar lookups
    pub fn scalar(&self) -> Option<&str> {
        self.text(0, 0)
    }
}

/// One database session
///
/// Sessions are never shared between workers. Every method takes `&mut self`
/// so the borrow checker enforces that.
#[async_trait]
pub trait DumpConnection: Send + 'static {
    /// Run a statement and collect all of its rows
    async fn query(&mut self, sql: &str) -> Result<ResultSet>;

    /// Run a statement, discarding any rows
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a statement and hand each row to `consumer`, returning the row count
    ///
    /// The default collects the result first; sessions that can read rows
    /// off the wire one at a time override it.
    async fn stream(&mut self, sql: &str, consumer: &mut dyn RowConsumer) -> Result<u64> {
        let result = self.query(sql).await?;
        let rows = result.rows.len() as u64;
        for row in result.rows {
            consumer.row(row)?;
        }
        Ok(rows)
    }

    /// Server-side identifier of this session
    fn connection_id(&self) -> u64;

    /// Close the session
    async fn close(self) -> Result<()>
    where
        Self: Sized;

    /// Open a snapshot-isolated read transaction
    async fn begin_snapshot(&mut self) -> Result<()> {
        self.execute("START TRANSACTION /*!40108 WITH CONSISTENT SNAPSHOT */")
            .await
            .context("Failed to start consistent snapshot")
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await.context("Failed to roll back")
    }
}

/// Factory for new sessions, one per worker plus one for the coordinator
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: DumpConnection;

    async fn connect(&self) -> Result<Self::Connection>;
}

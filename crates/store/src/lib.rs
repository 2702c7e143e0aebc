//! Columnar sink plumbing
//!
//! The pipeline only needs two operations from its store: a bulk insert
//! of a fixed column list and a scalar max-index lookup for resumption.
//! Both are issued over ClickHouse's HTTP interface as single SQL
//! statements. [`breaker::CircuitBreaker`] guards the insert path.

pub mod breaker;
pub mod clickhouse;
pub mod rows;
pub mod value;

use async_trait::async_trait;
use thiserror::Error;

pub use value::SqlValue;

/// One encoded row: values in the table's fixed column order.
pub type Row = Vec<SqlValue>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(String),

    #[error("store rejected the statement: {0}")]
    Server(String),

    #[error("unexpected store response: {0}")]
    Malformed(String),
}

/// Bulk-insert seam. The production implementation is
/// [`clickhouse::TableWriter`]; tests substitute mocks.
#[async_trait]
pub trait RowWriter: Send + Sync + 'static {
    async fn write_rows(&self, rows: &[Row]) -> Result<(), StoreError>;
}

/// Resume seam: highest index already stored for a log identity.
#[async_trait]
pub trait IndexLookup: Send + Sync + 'static {
    async fn max_index(&self, log_id: &str) -> Result<Option<u64>, StoreError>;
}

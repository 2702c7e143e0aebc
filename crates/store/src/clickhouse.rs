//! ClickHouse client over the native HTTP interface
//!
//! Statements are POSTed as plain SQL; credentials travel in the
//! `X-ClickHouse-*` headers. Connection parameters come from the
//! environment so deployments configure the store without flags.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use tracing::{debug, info};
use url::Url;

use crate::value::SqlValue;
use crate::{IndexLookup, Row, RowWriter, StoreError};

/// Timeout for the startup ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters, read from `CLICKHOUSE_*` variables.
#[derive(Clone, Debug)]
pub struct ClickhouseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ClickhouseConfig {
    pub fn from_env() -> EyreResult<Self> {
        let host = env::var("CLICKHOUSE_HOST").unwrap_or_else(|_| "localhost".to_owned());
        let port = match env::var("CLICKHOUSE_PORT") {
            Ok(raw) => raw
                .parse()
                .wrap_err_with(|| format!("CLICKHOUSE_PORT is not a port number: {raw}"))?,
            Err(_) => 8123,
        };

        Ok(Self {
            host,
            port,
            user: env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_owned()),
            password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            database: env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "default".to_owned()),
        })
    }

    fn endpoint(&self) -> EyreResult<Url> {
        Url::parse(&format!("http://{}:{}/", self.host, self.port))
            .wrap_err("building store endpoint")
    }
}

/// Shared handle to one ClickHouse instance.
#[derive(Clone, Debug)]
pub struct Clickhouse {
    http: reqwest::Client,
    endpoint: Url,
    config: ClickhouseConfig,
}

impl Clickhouse {
    pub fn connect(config: ClickhouseConfig) -> EyreResult<Self> {
        let endpoint = config.endpoint()?;

        Ok(Self {
            http: reqwest::Client::builder().build()?,
            endpoint,
            config,
        })
    }

    /// One round-trip to confirm the store is reachable. Run once at
    /// startup; an unreachable store is a configuration error.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let _one = self
            .query_raw("SELECT 1", Some(PING_TIMEOUT))
            .await?;

        info!(host = %self.config.host, database = %self.config.database, "store is reachable");
        Ok(())
    }

    /// Executes a statement, discarding the response body.
    pub async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        let _body = self.query_raw(sql, None).await?;
        Ok(())
    }

    /// Executes a query and returns the raw response body.
    pub async fn query_raw(
        &self,
        sql: &str,
        timeout: Option<Duration>,
    ) -> Result<String, StoreError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .query(&[("database", self.config.database.as_str())])
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(sql.to_owned());

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(StoreError::Server(format!("{status}: {}", body.trim())));
        }

        Ok(body)
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.config.database
    }
}

/// Binds a [`Clickhouse`] handle to one table and its fixed column
/// list.
#[derive(Clone, Debug)]
pub struct TableWriter {
    store: Clickhouse,
    table: String,
    columns: &'static [&'static str],
    id_column: &'static str,
    index_column: &'static str,
}

impl TableWriter {
    #[must_use]
    pub fn new(
        store: Clickhouse,
        table: impl Into<String>,
        columns: &'static [&'static str],
        id_column: &'static str,
        index_column: &'static str,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            columns,
            id_column,
            index_column,
        }
    }

    /// Renders the single multi-row insert statement for a batch.
    #[must_use]
    pub fn insert_sql(&self, rows: &[Row]) -> String {
        let mut sql = format!(
            "INSERT INTO {}.{} ({}) VALUES ",
            self.store.database(),
            self.table,
            self.columns.join(", "),
        );

        for (row_position, row) in rows.iter().enumerate() {
            debug_assert_eq!(row.len(), self.columns.len(), "row/column arity mismatch");

            if row_position > 0 {
                sql.push(',');
            }
            sql.push('(');
            for (cell_position, cell) in row.iter().enumerate() {
                if cell_position > 0 {
                    sql.push(',');
                }
                cell.render(&mut sql);
            }
            sql.push(')');
        }

        sql
    }
}

#[async_trait]
impl RowWriter for TableWriter {
    async fn write_rows(&self, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let sql = self.insert_sql(rows);
        debug!(rows = rows.len(), table = %self.table, "flushing batch");
        self.store.execute(&sql).await
    }
}

#[async_trait]
impl IndexLookup for TableWriter {
    async fn max_index(&self, log_id: &str) -> Result<Option<u64>, StoreError> {
        let mut id_literal = String::new();
        SqlValue::Str(log_id.to_owned()).render(&mut id_literal);

        let sql = format!(
            "SELECT count(), max({index}) FROM {db}.{table} WHERE {id} = {literal} FORMAT TabSeparated",
            index = self.index_column,
            db = self.store.database(),
            table = self.table,
            id = self.id_column,
            literal = id_literal,
        );

        let body = self.store.query_raw(&sql, None).await?;
        let line = body.trim();
        let (count, max) = line
            .split_once('\t')
            .ok_or_else(|| StoreError::Malformed(format!("expected count/max pair, got {line:?}")))?;

        let count: u64 = count
            .parse()
            .map_err(|_| StoreError::Malformed(format!("count is not a number: {count:?}")))?;

        if count == 0 {
            return Ok(None);
        }

        let max = max
            .parse()
            .map_err(|_| StoreError::Malformed(format!("max is not a number: {max:?}")))?;

        Ok(Some(max))
    }
}

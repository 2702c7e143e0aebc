//! Flags and wiring shared by both ingesters

use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Args;
use eyre::{Result as EyreResult, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use treeline_client::proxy::ProxyPool;
use treeline_store::clickhouse::{Clickhouse, ClickhouseConfig, TableWriter};

#[derive(Debug, Args)]
pub struct ProxyArgs {
    /// Static proxy list file, one host:port:user:pass per line
    #[arg(long, value_name = "PATH", conflicts_with = "proxy_list_url")]
    pub proxy_file: Option<Utf8PathBuf>,

    /// URL serving the proxy list; re-read every minute
    #[arg(long, value_name = "URL")]
    pub proxy_list_url: Option<Url>,
}

impl ProxyArgs {
    /// Builds the pool and, for URL-backed pools, starts the refresh
    /// loop.
    pub async fn build_pool(
        &self,
        cancel: &CancellationToken,
    ) -> EyreResult<Option<Arc<ProxyPool>>> {
        let pool = match (&self.proxy_file, &self.proxy_list_url) {
            (Some(path), None) => Arc::new(ProxyPool::from_file(path.clone()).await?),
            (None, Some(url)) => {
                let pool = Arc::new(ProxyPool::from_url(url.clone()).await?);
                let _refresher =
                    tokio::spawn(Arc::clone(&pool).refresh_loop(cancel.clone()));
                pool
            }
            (None, None) => return Ok(None),
            (Some(_), Some(_)) => unreachable!("clap rejects the combination"),
        };

        Ok(Some(pool))
    }
}

/// Connects to the store and proves it is reachable before any fetch
/// work starts.
pub async fn connect_store() -> EyreResult<Clickhouse> {
    let config = ClickhouseConfig::from_env()?;
    let store = Clickhouse::connect(config)?;

    store
        .ping()
        .await
        .wrap_err("store is not reachable, check CLICKHOUSE_* variables")?;

    Ok(store)
}

/// Binds a writer to the given table with its fixed column list.
pub fn table_writer(
    store: Clickhouse,
    table: &'static str,
    columns: &'static [&'static str],
    id_column: &'static str,
) -> Arc<TableWriter> {
    Arc::new(TableWriter::new(store, table, columns, id_column, "idx"))
}

/// Cancels the token on SIGINT or SIGTERM.
pub fn spawn_signal_handler(cancel: CancellationToken) {
    let _handle = tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _interrupted = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _interrupted = tokio::signal::ctrl_c().await;
}

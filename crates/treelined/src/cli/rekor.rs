use clap::Parser;
use eyre::{bail, Result as EyreResult};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use treeline_client::rekor::{RekorClient, RETRIEVE_CAP};
use treeline_ingest::supervisor::{run_rekor, RekorIngestConfig};
use treeline_store::rows::REKOR_COLUMNS;

use super::shared::{connect_store, spawn_signal_handler, table_writer, ProxyArgs};

pub const REKOR_TABLE: &str = "rekor_entries";

/// Upstream bound on useful fan-out.
pub const MAX_CONCURRENCY: usize = 500;

#[derive(Debug, Parser)]
pub struct RekorCommand {
    /// Rekor instance to mirror
    #[arg(long, value_name = "URL", default_value = "https://rekor.sigstore.dev")]
    pub rekor_url: Url,

    /// First tree-local index to fetch; -1 resumes from the stored
    /// maximum
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub start_index: i64,

    /// Entries per retrieve request (upstream caps at 10)
    #[arg(long, default_value_t = 10)]
    pub batch_size: u64,

    /// Concurrent retrieve requests
    #[arg(long, default_value_t = 64)]
    pub concurrency: usize,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

impl RekorCommand {
    pub async fn run(self) -> EyreResult<()> {
        if self.batch_size == 0 || self.batch_size as usize > RETRIEVE_CAP {
            bail!("--batch-size must be between 1 and {RETRIEVE_CAP}");
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            bail!("--concurrency must be between 1 and {MAX_CONCURRENCY}");
        }

        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        let pool = self.proxy.build_pool(&cancel).await?;
        let store = connect_store().await?;
        let writer = table_writer(store, REKOR_TABLE, REKOR_COLUMNS, "tree_id");

        let client = RekorClient::new(self.rekor_url.clone(), pool)?;
        info!(rekor_url = %self.rekor_url, "mirroring Rekor log");

        run_rekor(
            client,
            writer.clone(),
            writer,
            RekorIngestConfig::new(self.start_index, self.batch_size, self.concurrency),
            cancel,
        )
        .await?;

        Ok(())
    }
}

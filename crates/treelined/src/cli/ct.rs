use clap::Parser;
use eyre::{bail, Result as EyreResult};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use treeline_client::ct::{CtClient, MAX_RANGE};
use treeline_ingest::supervisor::{run_ct, CtIngestConfig};
use treeline_store::rows::CT_COLUMNS;

use super::shared::{connect_store, spawn_signal_handler, table_writer, ProxyArgs};

pub const CT_TABLE: &str = "ct_entries";

#[derive(Debug, Parser)]
pub struct CtCommand {
    /// Base URL of the CT log
    #[arg(long, value_name = "URL")]
    pub log_url: Url,

    /// First leaf index to fetch; -1 resumes from the stored maximum
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub start_index: i64,

    /// Leaves per get-entries request
    #[arg(long, default_value_t = 256)]
    pub batch_size: u64,

    #[command(flatten)]
    pub proxy: ProxyArgs,
}

impl CtCommand {
    pub async fn run(self) -> EyreResult<()> {
        if self.batch_size == 0 || self.batch_size > MAX_RANGE {
            bail!("--batch-size must be between 1 and {MAX_RANGE}");
        }

        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        let pool = self.proxy.build_pool(&cancel).await?;
        let store = connect_store().await?;
        let writer = table_writer(store, CT_TABLE, CT_COLUMNS, "log_id");

        let client = CtClient::new(self.log_url, pool)?;
        info!(log_id = client.log_id(), "mirroring CT log");

        run_ct(
            client,
            writer.clone(),
            writer,
            CtIngestConfig::new(self.start_index, self.batch_size),
            cancel,
        )
        .await?;

        Ok(())
    }
}

use clap::{Parser, Subcommand};
use const_format::concatcp;
use eyre::Result as EyreResult;

mod ct;
mod rekor;
mod shared;

use ct::CtCommand;
use rekor::RekorCommand;

pub const EXAMPLES: &str = r"
  # Mirror a CT log, resuming from the stored high-water mark
  $ treelined ct --log-url https://ct.googleapis.com/logs/us1/argon2025h2

  # Mirror Rekor from the beginning with 64 fetch workers
  $ treelined rekor --start-index 0 --concurrency 64

  # Route egress through a rotating proxy list
  $ treelined ct --log-url https://ct.example/log --proxy-list-url https://proxies.example/list.txt
";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concatcp!(
    "Environment variables:\n",
    "  CLICKHOUSE_HOST        Store host (default localhost)\n",
    "  CLICKHOUSE_PORT        Store HTTP port (default 8123)\n",
    "  CLICKHOUSE_USER        Store user (default default)\n",
    "  CLICKHOUSE_PASSWORD    Store password\n",
    "  CLICKHOUSE_DATABASE    Store database (default default)\n\n",
    "Examples:",
    EXAMPLES
))]
pub struct RootCommand {
    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    /// Mirror a Certificate Transparency log
    Ct(CtCommand),
    /// Mirror a Rekor transparency log
    Rekor(RekorCommand),
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Ct(ct) => ct.run().await,
            SubCommands::Rekor(rekor) => rekor.run().await,
        }
    }
}

//! Log identity and head state

use serde::{Deserialize, Serialize};
use url::Url;

/// A prior, read-only tree of a sharded log.
///
/// Rekor retires trees but keeps serving them; their leaf counts still
/// contribute to the global leaf numbering of the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveShard {
    pub tree_id: String,
    pub tree_size: u64,
}

/// Current head of an append-only log.
///
/// `tree_id` identifies the active tree; resumption and row identity are
/// scoped to it. `tree_size` is the leaf count of the active tree alone,
/// so for a sharded log the global head is `global_size()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogState {
    pub tree_id: String,
    pub tree_size: u64,
    #[serde(default)]
    pub inactive: Vec<InactiveShard>,
}

impl LogState {
    #[must_use]
    pub fn new(tree_id: impl Into<String>, tree_size: u64) -> Self {
        Self {
            tree_id: tree_id.into(),
            tree_size,
            inactive: Vec::new(),
        }
    }

    /// Sum of all inactive shard sizes.
    #[must_use]
    pub fn inactive_total(&self) -> u64 {
        self.inactive.iter().map(|shard| shard.tree_size).sum()
    }

    /// Total leaf count across inactive shards and the active tree.
    #[must_use]
    pub fn global_size(&self) -> u64 {
        self.inactive_total() + self.tree_size
    }

    /// Maps an active-tree-local index to its global index.
    #[must_use]
    pub fn global_index(&self, local: u64) -> u64 {
        self.inactive_total() + local
    }

    /// Maps a global index to an active-tree-local index.
    ///
    /// Returns `None` when the global index falls inside an inactive shard.
    #[must_use]
    pub fn local_index(&self, global: u64) -> Option<u64> {
        global.checked_sub(self.inactive_total())
    }
}

/// Derives a stable log identity from a CT log URL.
///
/// The scheme is dropped and trailing slashes are trimmed, so
/// `https://ct.example.com/2024h2/` and `https://ct.example.com/2024h2`
/// name the same log.
#[must_use]
pub fn log_identity_from_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    format!("{host}{path}")
}

//! Rekor log client
//!
//! `GET /api/v1/log` reports the active tree and its inactive shards;
//! `POST /api/v1/log/entries/retrieve` fetches up to ten entries by
//! global index. The retrieve response is an unordered list of
//! single-entry `{uuid: entry}` maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use treeline_primitives::{InactiveShard, LogState};

use crate::error::{classify_status, FetchError};
use crate::proxy::ProxyPool;
use crate::{direct_client, transport};

/// Upstream hard limit on `logIndexes` per retrieve call.
pub const RETRIEVE_CAP: usize = 10;

/// `GET /api/v1/log` response.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorLogInfo {
    #[serde(rename = "treeID")]
    pub tree_id: String,
    pub tree_size: u64,
    #[serde(default)]
    pub root_hash: String,
    #[serde(default)]
    pub inactive_shards: Vec<RekorShard>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorShard {
    #[serde(rename = "treeID")]
    pub tree_id: String,
    pub tree_size: u64,
}

impl RekorLogInfo {
    #[must_use]
    pub fn to_state(&self) -> LogState {
        LogState {
            tree_id: self.tree_id.clone(),
            tree_size: self.tree_size,
            inactive: self
                .inactive_shards
                .iter()
                .map(|shard| InactiveShard {
                    tree_id: shard.tree_id.clone(),
                    tree_size: shard.tree_size,
                })
                .collect(),
        }
    }
}

/// Inclusion proof attached to a retrieved entry. `log_index` here is
/// local to the tree named by the checkpoint, unlike the global index on
/// the entry itself.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub log_index: u64,
    #[serde(default)]
    pub root_hash: String,
    #[serde(default)]
    pub tree_size: u64,
    #[serde(default)]
    pub hashes: Vec<String>,
    pub checkpoint: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub inclusion_proof: Option<InclusionProof>,
    #[serde(default)]
    pub signed_entry_timestamp: String,
}

/// One retrieved log entry, as returned by the batch endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorLogEntry {
    #[serde(rename = "logID", default)]
    pub log_id: String,
    /// Global index across all shards.
    pub log_index: u64,
    /// base64 entry body.
    pub body: String,
    /// Unix seconds.
    pub integrated_time: i64,
    pub verification: Verification,
}

/// A retrieved entry together with its content-hash identifier.
#[derive(Clone, Debug)]
pub struct RetrievedEntry {
    pub uuid: String,
    pub entry: RekorLogEntry,
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    #[serde(rename = "logIndexes")]
    log_indexes: &'a [u64],
}

/// Client for a Rekor instance.
#[derive(Clone, Debug)]
pub struct RekorClient {
    base: Url,
    direct: reqwest::Client,
    pool: Option<Arc<ProxyPool>>,
}

impl RekorClient {
    pub fn new(base: Url, pool: Option<Arc<ProxyPool>>) -> eyre::Result<Self> {
        Ok(Self {
            base,
            direct: direct_client()?,
            pool,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    /// Fetches the current tree info, including inactive shards.
    pub async fn log_info(&self) -> Result<RekorLogInfo, FetchError> {
        let http = transport(&self.direct, self.pool.as_deref())?;

        let response = http
            .get(self.endpoint("/api/v1/log"))
            .send()
            .await
            .map_err(|err| FetchError::from_transport(&err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::from_transport(&err))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|err| FetchError::Malformed(format!("decoding log info: {err}")))
    }

    pub async fn state(&self) -> Result<LogState, FetchError> {
        Ok(self.log_info().await?.to_state())
    }

    /// Retrieves entries by global index. The response order is not
    /// meaningful; callers sort by the global index when order matters.
    pub async fn retrieve(&self, indexes: &[u64]) -> Result<Vec<RetrievedEntry>, FetchError> {
        if indexes.len() > RETRIEVE_CAP {
            return Err(FetchError::BatchTooLarge {
                got: indexes.len(),
                cap: RETRIEVE_CAP,
            });
        }

        let http = transport(&self.direct, self.pool.as_deref())?;

        let response = http
            .post(self.endpoint("/api/v1/log/entries/retrieve"))
            .json(&RetrieveRequest {
                log_indexes: indexes,
            })
            .send()
            .await
            .map_err(|err| FetchError::from_transport(&err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::from_transport(&err))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let maps: Vec<BTreeMap<String, RekorLogEntry>> = serde_json::from_str(&body)
            .map_err(|err| FetchError::Malformed(format!("decoding retrieve response: {err}")))?;

        Ok(maps
            .into_iter()
            .flat_map(BTreeMap::into_iter)
            .map(|(uuid, entry)| RetrievedEntry { uuid, entry })
            .collect())
    }
}

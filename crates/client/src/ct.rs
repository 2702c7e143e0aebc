//! RFC 6962 log client
//!
//! Two endpoints are used: `get-sth` for the current head and
//! `get-entries` for leaf ranges. Logs cap the range size server-side
//! and may return fewer entries than asked for; callers are expected to
//! re-request the remainder.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use treeline_primitives::{log_identity_from_url, LogState};

use crate::error::{classify_status, snippet, FetchError};
use crate::proxy::ProxyPool;
use crate::{direct_client, transport};

/// Hard upper bound on a single `get-entries` range. Most logs cap far
/// lower and truncate the response instead of failing.
pub const MAX_RANGE: u64 = 1024;

/// `get-sth` response.
#[derive(Clone, Debug, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    pub sha256_root_hash: String,
    pub tree_head_signature: String,
}

/// One element of a `get-entries` response.
#[derive(Clone, Debug, Deserialize)]
pub struct CtLeaf {
    /// base64 `MerkleTreeLeaf` bytes.
    pub leaf_input: String,
    /// base64 chain / precert data. Carried along but not decoded here.
    #[serde(default)]
    pub extra_data: String,
}

#[derive(Debug, Deserialize)]
struct GetEntriesResponse {
    entries: Vec<CtLeaf>,
}

/// Client for one CT log.
#[derive(Clone, Debug)]
pub struct CtClient {
    base: Url,
    log_id: String,
    direct: reqwest::Client,
    pool: Option<Arc<ProxyPool>>,
}

impl CtClient {
    pub fn new(base: Url, pool: Option<Arc<ProxyPool>>) -> eyre::Result<Self> {
        let log_id = log_identity_from_url(&base);

        Ok(Self {
            base,
            log_id,
            direct: direct_client()?,
            pool,
        })
    }

    /// Stable identity of the mirrored log, derived from its URL.
    #[must_use]
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    fn endpoint(&self, leaf: &str) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}/ct/v1/{leaf}", self.base.path().trim_end_matches('/'));
        url.set_path(&path);
        url
    }

    /// Fetches the current signed tree head.
    pub async fn get_sth(&self) -> Result<SignedTreeHead, FetchError> {
        let http = transport(&self.direct, self.pool.as_deref())?;

        let response = http
            .get(self.endpoint("get-sth"))
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
            .map_err(|err| FetchError::Malformed(format!("decoding get-sth: {err}")))
    }

    /// Current head as a [`LogState`]. CT logs are unsharded, so the
    /// inactive list is always empty.
    pub async fn state(&self) -> Result<LogState, FetchError> {
        let sth = self.get_sth().await?;
        Ok(LogState::new(self.log_id.clone(), sth.tree_size))
    }

    /// Fetches leaves for `[start, end]` inclusive, in order.
    ///
    /// The log may truncate the range; the returned vector then covers a
    /// prefix starting at `start`. A request past the head surfaces as
    /// [`FetchError::EndOfLog`].
    pub async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<CtLeaf>, FetchError> {
        debug_assert!(start <= end, "inverted range {start}..={end}");
        debug_assert!(end - start < MAX_RANGE, "range wider than {MAX_RANGE}");

        let http = transport(&self.direct, self.pool.as_deref())?;
        let mut url = self.endpoint("get-entries");
        url.query_pairs_mut()
            .append_pair("start", &start.to_string())
            .append_pair("end", &end.to_string());

        let response = http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_transport(&err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::from_transport(&err))?;

        if status.as_u16() == 400 {
            // Logs answer a range past the head with 400. Only treat the
            // known shapes as end-of-log; anything else may be a real
            // client error and degrades to a retry.
            if is_past_head_body(&body) {
                debug!(start, end, "range is past the log head");
                return Err(FetchError::EndOfLog);
            }
            return Err(FetchError::Transient(format!(
                "unexpected 400 from get-entries: {}",
                snippet(&body)
            )));
        }

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let decoded: GetEntriesResponse = serde_json::from_str(&body)
            .map_err(|err| FetchError::Malformed(format!("decoding get-entries: {err}")))?;

        if decoded.entries.is_empty() {
            return Err(FetchError::EndOfLog);
        }

        Ok(decoded.entries)
    }
}

fn is_past_head_body(body: &str) -> bool {
    body.trim().is_empty()
        || body.contains("Bad Request")
        || body.contains("need tree size")
        || serde_json::from_str::<GetEntriesResponse>(body)
            .map(|decoded| decoded.entries.is_empty())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_under_the_log_prefix() {
        let client = CtClient::new(
            Url::parse("https://ct.example.com/2024h2/").unwrap(),
            None,
        )
        .unwrap();

        assert_eq!(
            client.endpoint("get-sth").as_str(),
            "https://ct.example.com/2024h2/ct/v1/get-sth"
        );
        assert_eq!(client.log_id(), "ct.example.com/2024h2");
    }

    #[test]
    fn past_head_bodies_are_recognized() {
        assert!(is_past_head_body(""));
        assert!(is_past_head_body("Bad Request"));
        assert!(is_past_head_body("need tree size: 42"));
        assert!(is_past_head_body(r#"{"entries":[]}"#));
        assert!(!is_past_head_body("start parameter is not a number"));
    }

    #[test]
    fn sth_decodes() {
        let sth: SignedTreeHead = serde_json::from_str(
            r#"{"tree_size":12345,"timestamp":1700000000000,
                "sha256_root_hash":"qqqq","tree_head_signature":"cccc"}"#,
        )
        .unwrap();

        assert_eq!(sth.tree_size, 12345);
        assert_eq!(sth.timestamp, 1_700_000_000_000);
    }
}

//! Rotating egress proxy pool
//!
//! A pool is loaded once from disk or bound to a URL that is re-read
//! every minute and atomically swapped. Entries are handed out
//! round-robin and every draw builds a fresh transport, so concurrent
//! batches leave through different proxies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use eyre::{bail, Result as EyreResult, WrapErr};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::{REQUEST_TIMEOUT, USER_AGENT};

/// How often a URL-backed pool is re-read.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// One `host:port:user:pass` proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEntry {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl ProxyEntry {
    /// Parses a list line. Returns `None` for lines that do not have the
    /// expected four fields or a numeric port.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().splitn(4, ':');

        let host = fields.next()?.trim();
        let port = fields.next()?.trim().parse::<u16>().ok()?;
        let user = fields.next()?.trim();
        let pass = fields.next()?.trim();

        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            pass: pass.to_owned(),
        })
    }

    #[must_use]
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Where the pool's entries come from.
#[derive(Clone, Debug)]
enum ProxySource {
    File(Utf8PathBuf),
    Url(Url),
}

/// Round-robin pool of egress proxies.
#[derive(Debug)]
pub struct ProxyPool {
    entries: RwLock<Arc<Vec<ProxyEntry>>>,
    cursor: AtomicUsize,
    source: ProxySource,
}

impl ProxyPool {
    /// Loads a static pool from a file on disk.
    pub async fn from_file(path: Utf8PathBuf) -> EyreResult<Self> {
        let body = tokio::fs::read_to_string(&path)
            .await
            .wrap_err_with(|| format!("reading proxy list from {path}"))?;
        let entries = parse_list(&body);

        if entries.is_empty() {
            bail!("proxy list {path} contains no usable entries");
        }

        info!(count = entries.len(), %path, "loaded proxy pool");

        Ok(Self {
            entries: RwLock::new(Arc::new(entries)),
            cursor: AtomicUsize::new(0),
            source: ProxySource::File(path),
        })
    }

    /// Fetches the initial pool from a URL. Call [`Self::spawn_refresh`]
    /// afterwards to keep it current.
    pub async fn from_url(url: Url) -> EyreResult<Self> {
        let entries = fetch_list(&url)
            .await
            .wrap_err_with(|| format!("fetching proxy list from {url}"))?;

        if entries.is_empty() {
            bail!("proxy list at {url} contains no usable entries");
        }

        info!(count = entries.len(), %url, "loaded proxy pool");

        Ok(Self {
            entries: RwLock::new(Arc::new(entries)),
            cursor: AtomicUsize::new(0),
            source: ProxySource::Url(url),
        })
    }

    /// Builds a pool directly from entries. Primarily for tests.
    pub fn from_entries(entries: Vec<ProxyEntry>) -> EyreResult<Self> {
        if entries.is_empty() {
            bail!("proxy pool cannot be empty");
        }

        Ok(Self {
            entries: RwLock::new(Arc::new(entries)),
            cursor: AtomicUsize::new(0),
            source: ProxySource::File(Utf8PathBuf::from("<static>")),
        })
    }

    /// Next entry, round-robin over the current snapshot.
    #[must_use]
    pub fn next(&self) -> ProxyEntry {
        let snapshot = Arc::clone(&self.entries.read());
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        snapshot[index].clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh transport routed through the next pool entry.
    pub fn build_client(&self) -> Result<reqwest::Client, FetchError> {
        let entry = self.next();

        let proxy = reqwest::Proxy::all(entry.proxy_url())
            .map_err(|err| FetchError::Transient(format!("invalid proxy entry: {err}")))?
            .basic_auth(&entry.user, &entry.pass);

        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .proxy(proxy)
            .build()
            .map_err(|err| FetchError::Transient(format!("building proxied client: {err}")))
    }

    /// Periodically re-reads a URL-backed pool until shutdown. A failed
    /// or empty refresh keeps the previous entries. File-backed pools
    /// return immediately.
    pub async fn refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let ProxySource::Url(url) = self.source.clone() else {
            return;
        };

        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        let _first = ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("proxy refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match fetch_list(&url).await {
                Ok(entries) if entries.is_empty() => {
                    warn!(%url, "proxy list refresh returned no entries, keeping previous pool");
                }
                Ok(entries) => {
                    let count = entries.len();
                    *self.entries.write() = Arc::new(entries);
                    debug!(count, "proxy pool refreshed");
                }
                Err(err) => {
                    warn!(%url, error = %err, "proxy list refresh failed, keeping previous pool");
                }
            }
        }
    }
}

fn parse_list(body: &str) -> Vec<ProxyEntry> {
    let mut entries = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match ProxyEntry::parse(line) {
            Some(entry) => entries.push(entry),
            None => warn!(%line, "skipping malformed proxy list line"),
        }
    }

    entries
}

async fn fetch_list(url: &Url) -> EyreResult<Vec<ProxyEntry>> {
    let response = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?;

    Ok(parse_list(&response.text().await?))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entry(host: &str) -> ProxyEntry {
        ProxyEntry {
            host: host.to_owned(),
            port: 8080,
            user: "u".to_owned(),
            pass: "p".to_owned(),
        }
    }

    #[test]
    fn parses_well_formed_lines() {
        let parsed = ProxyEntry::parse("10.0.0.1:3128:alice:s3cret").unwrap();

        assert_eq!(parsed.host, "10.0.0.1");
        assert_eq!(parsed.port, 3128);
        assert_eq!(parsed.user, "alice");
        assert_eq!(parsed.pass, "s3cret");
        assert_eq!(parsed.proxy_url(), "http://10.0.0.1:3128");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(ProxyEntry::parse("nonsense"), None);
        assert_eq!(ProxyEntry::parse("host:notaport:u:p"), None);
        assert_eq!(ProxyEntry::parse(":8080:u:p"), None);
    }

    #[test]
    fn list_skips_comments_and_blanks() {
        let body = "# header\n\n10.0.0.1:1:u:p\nbroken line\n10.0.0.2:2:u:p\n";
        let entries = parse_list(body);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host, "10.0.0.1");
        assert_eq!(entries[1].host, "10.0.0.2");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(ProxyPool::from_entries(Vec::new()).is_err());
    }

    #[test]
    fn round_robin_is_fair() {
        let pool =
            ProxyPool::from_entries(vec![entry("a"), entry("b"), entry("c"), entry("d")]).unwrap();

        let mut draws: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            *draws.entry(pool.next().host).or_default() += 1;
        }

        // 100 draws over 4 entries: every proxy lands within one draw of
        // the even share.
        for count in draws.values() {
            assert!((24..=26).contains(count), "uneven share: {draws:?}");
        }
    }
}

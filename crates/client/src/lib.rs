//! HTTP clients for the upstream transparency logs
//!
//! Two clients share the same shape: [`ct::CtClient`] speaks the RFC 6962
//! API, [`rekor::RekorClient`] speaks the Rekor REST API. Both classify
//! failures into the retryable kinds in [`error::FetchError`] and can
//! route traffic through a rotating [`proxy::ProxyPool`].

use std::time::Duration;

pub mod ct;
pub mod error;
pub mod proxy;
pub mod rekor;
pub mod retry;

pub use error::FetchError;

/// Per-request timeout applied to every upstream call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies the operator on every upstream request.
pub const USER_AGENT: &str = concat!(
    "treeline/",
    env!("CARGO_PKG_VERSION"),
    " (+https://github.com/treeline-dev/treeline)"
);

/// Builds the transport for one request.
///
/// When a proxy pool is present a fresh client is built around the next
/// pool entry, so each in-flight batch egresses through a different
/// proxy. Without a pool the shared direct client is reused and keeps
/// its per-host connection pool.
pub(crate) fn transport(
    direct: &reqwest::Client,
    pool: Option<&proxy::ProxyPool>,
) -> Result<reqwest::Client, FetchError> {
    match pool {
        Some(pool) => pool.build_client(),
        None => Ok(direct.clone()),
    }
}

pub(crate) fn direct_client() -> eyre::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?)
}

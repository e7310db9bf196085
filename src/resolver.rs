//! Source Resolver
//!
//! Normalizes a user-supplied download reference into something the swarm
//! engine can consume: either a magnet URI (passed through) or the raw
//! bytes of a `.torrent` file fetched from an indexer.
//!
//! Redirects are not auto-followed. Many indexers answer a download URL
//! with a 3xx whose `Location` is itself a magnet URI; auto-following
//! would turn that into a fetch of a nonsense target.

use crate::config::HostRewrite;
use crate::error::{Error, IndexerErrorKind, Result};
use bytes::Bytes;
use reqwest::redirect;
use std::time::Duration;
use url::Url;

/// A normalized download source, ready for the swarm engine
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    /// A magnet URI, passed through or recovered from a redirect
    Magnet(String),
    /// Raw `.torrent` file contents fetched from an indexer
    TorrentBytes(Bytes),
}

/// Resolves download references into magnet URIs or torrent bytes
pub struct SourceResolver {
    client: reqwest::Client,
    host_rewrite: Option<HostRewrite>,
}

impl SourceResolver {
    pub fn new(fetch_timeout: Duration, host_rewrite: Option<HostRewrite>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            host_rewrite,
        })
    }

    /// Resolve a reference into a source the engine can add.
    ///
    /// Non-HTTP references pass through unchanged (assumed magnet). HTTP(S)
    /// references are fetched with redirects disabled: a 3xx pointing at a
    /// magnet URI yields that magnet, any other 3xx is followed for exactly
    /// one more hop, and a 2xx body is taken as torrent bytes.
    pub async fn resolve(&self, reference: &str) -> Result<ResolvedSource> {
        let reference = match &self.host_rewrite {
            Some(rewrite) => rewrite.apply(reference),
            None => reference.to_string(),
        };

        if !is_http_url(&reference) {
            if reference.starts_with("magnet:") {
                return Ok(ResolvedSource::Magnet(reference));
            }
            // Not HTTP and not magnet-shaped: still passed through, the
            // engine is the authority on what it can parse.
            if reference.contains(':') {
                return Ok(ResolvedSource::Magnet(reference));
            }
            return Err(Error::UnresolvableSource { reference });
        }

        let redacted = redact_reference(&reference);
        tracing::debug!(reference = %redacted, "resolving indexer reference");

        let response = self
            .client
            .get(&reference)
            .send()
            .await
            .map_err(|e| Error::from_fetch(&e, &redacted))?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
                .ok_or_else(|| Error::Indexer {
                    kind: IndexerErrorKind::FetchFailed,
                    reference: redacted.clone(),
                    message: format!("redirect ({}) without a Location header", status),
                })?;

            if location.starts_with("magnet:") {
                tracing::debug!(reference = %redacted, "indexer redirected to magnet");
                return Ok(ResolvedSource::Magnet(location));
            }

            // One more hop, no further
            return self.fetch_torrent(&location, &redacted).await;
        }

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::from_fetch(&e, &redacted))?;
            return Ok(ResolvedSource::TorrentBytes(body));
        }

        Err(Error::Indexer {
            kind: IndexerErrorKind::FetchFailed,
            reference: redacted,
            message: format!("indexer returned status {}", status),
        })
    }

    async fn fetch_torrent(&self, url: &str, redacted: &str) -> Result<ResolvedSource> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::from_fetch(&e, redacted))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Indexer {
                kind: IndexerErrorKind::FetchFailed,
                reference: redacted.to_string(),
                message: format!("redirect target returned status {}", status),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::from_fetch(&e, redacted))?;
        Ok(ResolvedSource::TorrentBytes(body))
    }
}

fn is_http_url(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Query parameters whose values are credentials and must never reach logs
/// or error messages.
const SENSITIVE_PARAMS: &[&str] = &["apikey", "api_key", "token", "passkey"];

/// Mask credential query parameters in a reference for diagnostics.
///
/// Falls back to the raw string if it does not parse as a URL; magnet URIs
/// and plain strings carry no indexer credentials.
pub fn redact_reference(reference: &str) -> String {
    let Ok(mut url) = Url::parse(reference) else {
        return reference.to_string();
    };
    if url.query().is_none() {
        return reference.to_string();
    }

    let has_sensitive = url
        .query_pairs()
        .any(|(k, _)| SENSITIVE_PARAMS.contains(&k.to_ascii_lowercase().as_str()));
    if !has_sensitive {
        return reference.to_string();
    }

    let redacted_pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if SENSITIVE_PARAMS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.into_owned(), "REDACTED".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    url.query_pairs_mut().clear().extend_pairs(redacted_pairs);
    url.to_string()
}

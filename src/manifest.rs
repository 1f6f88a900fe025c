//! The server-published hash manifest and its fetcher.
//!
//! The manifest is a flat JSON object mapping `"/relative/path"` to
//! `{size, time, hash}`. Two reserved keys carry metadata about the manifest
//! itself and are stripped before use.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::SyncCache;
use crate::errors::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};

/// Generation timestamp of the manifest, `yy-MM-dd-HH-mm-ss`.
pub const GENERATED_AT_KEY: &str = "__DateGeneratedUTC";
/// Identity tag of the server that produced the manifest.
pub const SERVER_KEY: &str = "__Server";

const FETCH_ATTEMPTS: u32 = 5;
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// One manifest entry, keyed elsewhere by its `/`-prefixed relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub time: String,
    pub hash: String,
}

pub type Manifest = BTreeMap<String, ManifestEntry>;

pub struct ParsedManifest {
    pub entries: Manifest,
    pub generated_at: Option<String>,
}

/// Parses a manifest payload, stripping the reserved metadata keys.
pub fn parse_manifest(body: &str) -> SyncResult<ParsedManifest> {
    let body = body.strip_prefix('\u{feff}').unwrap_or(body);
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(body)?;

    let mut entries = Manifest::new();
    let mut generated_at = None;
    for (key, value) in raw {
        if key == GENERATED_AT_KEY {
            generated_at = value.as_str().map(str::to_string);
            continue;
        }
        if key == SERVER_KEY {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_value(value).map_err(|e| {
            SyncError::InvalidManifest(format!("bad entry for {key:?}: {e}"))
        })?;
        entries.insert(key, entry);
    }
    Ok(ParsedManifest { entries, generated_at })
}

/// Talks to the hash-manifest endpoint and refreshes the cached copy.
pub struct ManifestClient {
    http: reqwest::Client,
    url: String,
}

impl ManifestClient {
    pub fn new(url: String) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hashsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, url })
    }

    /// Refreshes the cached manifest when the server has a newer one.
    ///
    /// Returns whether the manifest changed. With no cached freshness
    /// timestamp the manifest is fetched unconditionally and failures are
    /// fatal; otherwise a conditional HEAD decides whether to fetch, and an
    /// unavailable endpoint is tolerated (`Ok(false)`), which is what the
    /// periodic re-check wants.
    pub async fn refresh_if_stale(
        &self,
        cache: &mut SyncCache,
        sink: &dyn EventSink,
    ) -> SyncResult<bool> {
        let Some(cached_at) = cache.manifest_last_modified() else {
            self.fetch(cache, sink).await?;
            return Ok(true);
        };

        let response = match self.request_with_retry(reqwest::Method::HEAD).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("manifest check failed, will retry next cycle: {err}");
                return Ok(false);
            }
        };

        let Some(last_modified) = parse_last_modified(&response) else {
            tracing::warn!("the manifest endpoint did not report a last-modified time");
            return Ok(false);
        };

        if last_modified > cached_at {
            self.fetch(cache, sink).await?;
            Ok(true)
        } else {
            tracing::debug!("local manifest cache is already up to date");
            Ok(false)
        }
    }

    /// Unconditionally fetches and persists the manifest. The previously
    /// cached manifest is retained in memory for the deletion workflow.
    pub async fn fetch(&self, cache: &mut SyncCache, sink: &dyn EventSink) -> SyncResult<()> {
        sink.emit(SyncEvent::DownloadingManifest);
        let response = self.request_with_retry(reqwest::Method::GET).await?;
        let last_modified = parse_last_modified(&response);
        let body = response.text().await?;
        let parsed = parse_manifest(&body)?;

        tracing::info!("hashes have been updated ({} entries)", parsed.entries.len());
        cache.install_manifest(parsed.entries, last_modified, parsed.generated_at);
        cache.save()?;
        Ok(())
    }

    async fn request_with_retry(&self, method: reqwest::Method) -> SyncResult<reqwest::Response> {
        let mut attempt = 1;
        loop {
            let result = self
                .http
                .request(method.clone(), &self.url)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(response) => return Ok(response),
                Err(err) if attempt < FETCH_ATTEMPTS => {
                    tracing::warn!(
                        "{method} {} - attempt #{attempt} failed ({err}), retrying...",
                        self.url
                    );
                    attempt += 1;
                }
                Err(err) => {
                    return Err(SyncError::ManifestUnavailable(format!(
                        "{method} {} - all {FETCH_ATTEMPTS} attempts failed: {err}",
                        self.url
                    )))
                }
            }
        }
    }
}

fn parse_last_modified(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "__DateGeneratedUTC": "24-03-01-12-00-00",
        "__Server": "builder-1",
        "/a.txt": {"size": 10, "time": "2024-03-01 11:59:00", "hash": "0123456789abcdef0123456789abcdef"},
        "/maps/b.bin": {"size": 2048, "time": "2024-02-28 09:00:00", "hash": "fedcba9876543210fedcba9876543210"}
    }"#;

    #[test]
    fn reserved_keys_are_stripped_and_surfaced_as_metadata() {
        let parsed = parse_manifest(PAYLOAD).unwrap();
        assert_eq!(parsed.generated_at.as_deref(), Some("24-03-01-12-00-00"));
        assert_eq!(parsed.entries.len(), 2);
        assert!(!parsed.entries.contains_key(GENERATED_AT_KEY));
        assert!(!parsed.entries.contains_key(SERVER_KEY));
        assert_eq!(parsed.entries["/a.txt"].size, 10);
        assert_eq!(
            parsed.entries["/maps/b.bin"].hash,
            "fedcba9876543210fedcba9876543210"
        );
    }

    #[test]
    fn a_leading_bom_is_tolerated() {
        let with_bom = format!("\u{feff}{PAYLOAD}");
        assert_eq!(parse_manifest(&with_bom).unwrap().entries.len(), 2);
    }

    #[test]
    fn malformed_entries_are_reported_not_skipped() {
        let bad = r#"{"/a.txt": {"size": "ten"}}"#;
        assert!(matches!(
            parse_manifest(bad),
            Err(SyncError::InvalidManifest(_))
        ));
    }

    struct NullSink;
    impl EventSink for NullSink {
        fn emit(&self, _event: SyncEvent) {}
    }

    #[tokio::test]
    async fn an_unreachable_endpoint_reports_the_failure_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = SyncCache::load(&tmp.path().join("cache.dat"), tmp.path());
        // Port 9 (discard) refuses the connection outright.
        let client = ManifestClient::new("http://127.0.0.1:9/hashes.txt".into()).unwrap();

        let err = client.fetch(&mut cache, &NullSink).await.unwrap_err();
        let message = err.to_string();
        assert_eq!(message.matches("could not be fetched").count(), 1);
    }
}

//! Manifest fetcher and HTTP client construction

use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::manifest::Manifest;

pub fn build_client(config: &ClientConfig) -> Result<Client, SyncError> {
    let client = Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.transfer_timeout())
        .user_agent(concat!("hashsync/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// GET the remote manifest. Any failure here aborts the sync run.
pub async fn fetch_manifest(client: &Client, url: &Url, timeout: Duration) -> Result<Manifest, SyncError> {
    let fail = |reason: String| SyncError::ManifestFetch {
        url: url.to_string(),
        reason,
    };

    let resp = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| fail(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(fail(format!("HTTP {status}")));
    }
    let body = resp.bytes().await.map_err(|e| fail(e.to_string()))?;
    let manifest = Manifest::from_slice(&body).map_err(|e| fail(format!("bad manifest: {e}")))?;
    debug!(entries = manifest.len(), bytes = body.len(), "manifest fetched");
    Ok(manifest)
}

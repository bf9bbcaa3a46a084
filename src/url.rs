//! URL handling for the manifest and file routes

use percent_encoding::percent_decode_str;
use reqwest::Url;

use crate::error::SyncError;

/// Remote endpoint derived from the configured manifest URL
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    manifest: Url,
}

impl RemoteEndpoint {
    pub fn parse(manifest_url: &str) -> Result<Self, SyncError> {
        let manifest = Url::parse(manifest_url.trim())
            .map_err(|e| SyncError::InvalidUrl(format!("{manifest_url}: {e}")))?;
        match manifest.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SyncError::InvalidUrl(format!(
                    "{manifest_url}: unsupported scheme {other}"
                )))
            }
        }
        if manifest.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(manifest_url.to_string()));
        }
        Ok(Self { manifest })
    }

    pub fn manifest_url(&self) -> &Url {
        &self.manifest
    }

    /// `/file/<name>` on the same server, each name segment percent-encoded.
    /// The file route lives next to the manifest route, so a manifest URL of
    /// `http://h/dist/` yields `http://h/dist/file/<name>`.
    pub fn file_url(&self, name: &str) -> Url {
        let mut url = self.manifest.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().push("file");
            segs.extend(name.split('/').filter(|s| !s.is_empty()));
        }
        url
    }
}

/// Decode the `{path}` part of a `/file/{path}` request
pub fn decode_request_path(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

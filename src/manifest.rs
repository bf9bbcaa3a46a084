//! Manifest wire format and the atomically published cache file
//!
//! On the wire a manifest is a bare JSON array:
//! `[{"name": "dir/file.bin", "md5": "<hex>"}, ...]`

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;
use tracing::warn;

use crate::error::CacheRebuildError;
use crate::fs_enum::{CACHE_TEMP_SUFFIX, TEMP_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(rename = "md5")]
    pub hash: String,
}

impl ManifestEntry {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Parse a manifest received from a server. Names are a unique key; a
    /// repeated name keeps its first entry.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        let raw: Vec<ManifestEntry> = serde_json::from_slice(data)?;
        let mut seen = HashSet::with_capacity(raw.len());
        let mut entries = Vec::with_capacity(raw.len());
        for entry in raw {
            if seen.insert(entry.name.clone()) {
                entries.push(entry);
            } else {
                warn!(name = %entry.name, "duplicate manifest entry ignored");
            }
        }
        Ok(Self { entries })
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Body served when no cache has been published yet
pub const EMPTY_MANIFEST: &[u8] = b"[]";

/// Read the published cache verbatim. A missing cache is the empty manifest.
pub fn read_cache(path: &Path) -> io::Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(EMPTY_MANIFEST.to_vec()),
        Err(e) => Err(e),
    }
}

/// Publish `manifest` at `path`: serialize, write a temp file in the same
/// directory, then rename it over the old cache. Readers observe the old
/// file or the new one, never a partial write. On error the old cache is
/// left untouched.
pub fn write_cache_atomic(path: &Path, manifest: &Manifest) -> Result<(), CacheRebuildError> {
    let data = manifest.to_vec()?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let persist_err = |source| CacheRebuildError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(CACHE_TEMP_SUFFIX)
        .tempfile_in(&dir)
        .map_err(persist_err)?;
    tmp.write_all(&data).map_err(persist_err)?;
    tmp.flush().map_err(persist_err)?;
    tmp.as_file().sync_all().map_err(persist_err)?;
    tmp.persist(path).map_err(|e| persist_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_md5_field() {
        let m = Manifest::new(vec![ManifestEntry::new(
            "a.txt",
            "d41d8cd98f00b204e9800998ecf8427e",
        )]);
        let json = String::from_utf8(m.to_vec().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"[{"name":"a.txt","md5":"d41d8cd98f00b204e9800998ecf8427e"}]"#
        );
        assert_eq!(Manifest::from_slice(json.as_bytes()).unwrap(), m);
    }

    #[test]
    fn builder_order_is_by_name() {
        let m = Manifest::new(vec![
            ManifestEntry::new("b", "2"),
            ManifestEntry::new("a", "1"),
        ]);
        assert_eq!(m.entries[0].name, "a");
        assert_eq!(m.get("b").map(|e| e.hash.as_str()), Some("2"));
    }

    #[test]
    fn duplicate_names_keep_first() {
        let data = br#"[{"name":"x","md5":"1"},{"name":"x","md5":"2"}]"#;
        let m = Manifest::from_slice(data).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.entries[0].hash, "1");
    }

    #[test]
    fn missing_cache_reads_as_empty_array() {
        let tmp = tempfile::tempdir().unwrap();
        let data = read_cache(&tmp.path().join("nope.json")).unwrap();
        assert_eq!(data, EMPTY_MANIFEST);
        assert!(Manifest::from_slice(&data).unwrap().is_empty());
    }

    #[test]
    fn atomic_write_replaces_previous_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/manifest.json");
        write_cache_atomic(&path, &Manifest::new(vec![ManifestEntry::new("a", "1")])).unwrap();
        write_cache_atomic(
            &path,
            &Manifest::new(vec![ManifestEntry::new("a", "1"), ManifestEntry::new("b", "2")]),
        )
        .unwrap();
        let m = Manifest::from_slice(&read_cache(&path).unwrap()).unwrap();
        assert_eq!(m.len(), 2);
        // no temp files left behind
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}

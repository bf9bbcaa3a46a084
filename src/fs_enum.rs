use std::path::{Component, Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;
// Served-tree enumeration and manifest name handling

/// A regular file under the served root
#[derive(Debug, Clone)]
pub struct ServedFile {
    pub path: PathBuf,
    /// Root-relative, `/`-separated
    pub name: String,
}

/// Prefix shared by every temp file hashsync writes
pub const TEMP_PREFIX: &str = ".hashsync-";
/// In-flight download beside its destination
pub const PART_SUFFIX: &str = ".part";
/// Unpublished manifest beside the cache
pub const CACHE_TEMP_SUFFIX: &str = ".tmp";

/// True for names of hashsync's own temp files
pub fn is_temp_name(file_name: &str) -> bool {
    file_name.starts_with(TEMP_PREFIX)
        && (file_name.ends_with(PART_SUFFIX) || file_name.ends_with(CACHE_TEMP_SUFFIX))
}

/// Remove temp files left behind by a process that exited without cleanup.
/// Returns how many were removed.
pub fn sweep_stale_temps(dir: &Path, max_depth: usize) -> usize {
    let mut removed = 0;
    let walker = WalkDir::new(dir).max_depth(max_depth).follow_links(false);
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !entry.file_name().to_str().is_some_and(is_temp_name) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot remove stale temp file"),
        }
    }
    removed
}

/// Result of walking the served root
#[derive(Debug, Default)]
pub struct Enumeration {
    pub files: Vec<ServedFile>,
    /// Entries the walker could not read (logged and skipped)
    pub skipped: usize,
}

/// Build the manifest name for `path` relative to `root`.
/// Returns None if `path` is outside `root` or not valid UTF-8.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Lexical safety check on a manifest/request name.
///
/// Both `/` and `\` count as separators so a name cannot smuggle a parent
/// segment past a platform that only splits on one of them.
pub fn check_relative_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err("absolute path");
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err("drive prefix");
    }
    if name.contains('\0') {
        return Err("nul byte");
    }
    for seg in name.split(['/', '\\']) {
        if seg == ".." {
            return Err("parent segment");
        }
    }
    Ok(())
}

/// Join a checked manifest name onto a local root (client side).
/// Empty and `.` segments are dropped.
pub fn local_path_for(root: &Path, name: &str) -> Result<PathBuf, &'static str> {
    check_relative_name(name)?;
    let mut out = root.to_path_buf();
    let mut pushed = false;
    for seg in name.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg.contains('\\') {
            return Err("backslash in segment");
        }
        out.push(seg);
        pushed = true;
    }
    if !pushed {
        return Err("no path segments");
    }
    Ok(out)
}

/// Enumerate every regular file under `root`, skipping `exclude` (the cache
/// file when it lives inside the served tree) and hashsync temp files.
/// Symlinks are not followed.
pub fn enumerate_served(root: &Path, exclude: Option<&Path>) -> Enumeration {
    let mut out = Enumeration::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                out.skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if exclude.is_some_and(|x| x == path) || entry.file_name().to_str().is_some_and(is_temp_name) {
            continue;
        }
        let Some(name) = relative_name(root, path) else {
            warn!(path = %path.display(), "skipping file with non UTF-8 name");
            out.skipped += 1;
            continue;
        };
        out.files.push(ServedFile {
            path: path.to_path_buf(),
            name,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_slash_joined() {
        let root = Path::new("/srv/data");
        let p = root.join("a").join("b").join("c.txt");
        assert_eq!(relative_name(root, &p).as_deref(), Some("a/b/c.txt"));
        assert_eq!(relative_name(root, root), None);
        assert_eq!(relative_name(root, Path::new("/etc/passwd")), None);
    }

    #[test]
    fn lexical_check_rejects_traversal() {
        assert!(check_relative_name("a/b.txt").is_ok());
        assert!(check_relative_name("..a/b").is_ok());
        assert!(check_relative_name("../secret.txt").is_err());
        assert!(check_relative_name("a/../../x").is_err());
        assert!(check_relative_name("a\\..\\x").is_err());
        assert!(check_relative_name("/etc/passwd").is_err());
        assert!(check_relative_name("\\windows").is_err());
        assert!(check_relative_name("C:/boot.ini").is_err());
        assert!(check_relative_name("").is_err());
    }

    #[test]
    fn local_paths_stay_under_root() {
        let root = Path::new("/data");
        assert_eq!(
            local_path_for(root, "x/./y.bin").unwrap(),
            PathBuf::from("/data/x/y.bin")
        );
        assert!(local_path_for(root, "x/../../y").is_err());
        assert!(local_path_for(root, "./").is_err());
    }

    #[test]
    fn enumeration_finds_nested_files_and_skips_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub/deep")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"1").unwrap();
        std::fs::write(tmp.path().join("sub/deep/leaf.txt"), b"22").unwrap();
        std::fs::write(tmp.path().join("cache.json"), b"[]").unwrap();

        let cache = tmp.path().join("cache.json");
        let found = enumerate_served(tmp.path(), Some(&cache));
        let mut names: Vec<_> = found.files.iter().map(|f| f.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["sub/deep/leaf.txt", "top.txt"]);
        assert_eq!(found.skipped, 0);
    }

    #[test]
    fn temp_files_are_recognized_and_swept() {
        assert!(is_temp_name(".hashsync-x1Yz.part"));
        assert!(is_temp_name(".hashsync-x1Yz.tmp"));
        assert!(!is_temp_name("notes.part"));
        assert!(!is_temp_name(".hashsync-config.toml"));

        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(tmp.path().join(".hashsync-1.part"), b"p").unwrap();
        std::fs::write(tmp.path().join("a/b/.hashsync-2.part"), b"p").unwrap();

        let listed = enumerate_served(tmp.path(), None);
        assert_eq!(listed.files.len(), 1);
        assert_eq!(listed.files[0].name, "keep.txt");

        assert_eq!(sweep_stale_temps(tmp.path(), 1), 1);
        assert!(tmp.path().join("a/b/.hashsync-2.part").exists());
        assert_eq!(sweep_stale_temps(tmp.path(), usize::MAX), 1);
        assert!(tmp.path().join("keep.txt").exists());
    }
}

//! Durable JSON state: single-writer documents replaced atomically on disk.

pub mod json_store;
pub mod store;

pub use json_store::JsonStore;
pub use store::{DerivedHealth, StateStore};

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TMP_SUFFIX: &str = "tmp";

/// Write `bytes` to `path` via a sibling temp file, fsync and rename.
///
/// Readers of `path` observe either the previous or the new content, never
/// a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!("{ext}.{TMP_SUFFIX}"))
        .unwrap_or_else(|| TMP_SUFFIX.to_string());
    let tmp_path = path.with_extension(ext);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_content_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("doc.json");

        write_atomic(&path, b"{\"v\":1}").unwrap();
        write_atomic(&path, b"{\"v\":2}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");
        assert!(!path.with_extension("json.tmp").exists());
    }
}

/// Move an unparseable document aside as `<name>.corrupt-<timestamp>` and
/// return where it went.
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let quarantined = path.with_extension(format!(
        "corrupt-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S")
    ));
    fs::rename(path, &quarantined)?;
    Ok(quarantined)
}

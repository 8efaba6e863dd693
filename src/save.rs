//! # Persistence Helpers
//!
//! Every persisted record (configuration, key material) goes through
//! [`write_atomic`]: the contents are written to `<path>.tmp` and then renamed
//! over the target while a single process-wide lock is held, so a concurrent
//! reader never observes a partially written file.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{NetError, Result};

static SAVE_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn persistence(path: &Path, source: std::io::Error) -> NetError {
    NetError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `contents` to `path` via a temporary file and an atomic rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    replace_file(path, contents, false)
}

/// Like [`write_atomic`], but the temporary file is owner-only (`0600` on
/// unix) before anything is written to it.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    replace_file(path, contents, true)
}

fn replace_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;
    }

    let tmp = temp_path(path);
    let _guard = SAVE_LOCK.lock();

    if let Err(e) = write_temp(&tmp, contents, private) {
        let _ = fs::remove_file(&tmp);
        return Err(persistence(&tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(persistence(path, e));
    }

    debug!("Saved {} ({} bytes)", path.display(), contents.len());
    Ok(())
}

#[cfg_attr(not(unix), allow(unused_variables))]
fn write_temp(tmp: &Path, contents: &[u8], private: bool) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(tmp)?;
    // a leftover temp file keeps its old mode
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)
}

/// Reads a whole file under the save lock.
pub fn read(path: &Path) -> Result<String> {
    let _guard = SAVE_LOCK.lock();
    fs::read_to_string(path).map_err(|e| persistence(path, e))
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| NetError::config(e.to_string()))?;
    write_atomic(path, &content)
}

pub fn save_json_private<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| NetError::config(e.to_string()))?;
    write_private(path, &content)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read(path)?;
    serde_json::from_str(&content).map_err(|e| NetError::config(e.to_string()))
}

pub fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = toml::to_string_pretty(value).map_err(|e| NetError::config(e.to_string()))?;
    write_atomic(path, content.as_bytes())
}

pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read(path)?;
    toml::from_str(&content).map_err(|e| NetError::config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        values: Vec<u32>,
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("record.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(read(&path).unwrap(), "second");
        assert!(!temp_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_restricts_stale_temp_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secret.json");
        let tmp = temp_path(&path);
        fs::write(&tmp, b"left over").unwrap();
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644)).unwrap();

        write_private(&path, b"secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(read(&path).unwrap(), "secret");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_json_and_toml_helpers() {
        let temp_dir = TempDir::new().unwrap();
        let record = Record {
            name: "peer".to_string(),
            values: vec![1, 2, 3],
        };

        let json_path = temp_dir.path().join("record.json");
        save_json(&json_path, &record).unwrap();
        assert_eq!(load_json::<Record>(&json_path).unwrap(), record);

        let toml_path = temp_dir.path().join("record.toml");
        save_toml(&toml_path, &record).unwrap();
        assert_eq!(load_toml::<Record>(&toml_path).unwrap(), record);
    }

    #[test]
    fn test_missing_file_is_persistence_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = load_json::<Record>(&temp_dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, NetError::Persistence { .. }));
    }

    #[test]
    fn test_concurrent_writers_never_expose_partial_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = Arc::new(temp_dir.path().join("shared.txt"));
        let a = "a".repeat(64 * 1024);
        let b = "b".repeat(64 * 1024);
        write_atomic(&path, a.as_bytes()).unwrap();

        let handles: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .map(|content| {
                let path = path.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        write_atomic(&path, content.as_bytes()).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            let seen = read(&path).unwrap();
            assert!(seen == a || seen == b);
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}

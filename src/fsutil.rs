//! Filesystem plumbing shared by every durable component.
//!
//! All JSON state files are written with temp+rename atomicity so a crash
//! mid-write leaves either the old or the new file, never a torn one.
//! JSONL and markdown files are append-only.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error type for filesystem state operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl FsError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        FsError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Create a directory (and parents) with mode 0700 on unix.
pub fn ensure_dir(path: &Path) -> Result<(), FsError> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path).map_err(|e| FsError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(path, perms).map_err(|e| FsError::io(path, e))?;
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let ts = chrono::Utc::now().timestamp_millis();
    let rnd: u32 = rand::thread_rng().gen();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!("{name}.tmp-{pid}-{ts}-{rnd:08x}"))
}

fn restrict_mode(path: &Path) -> Result<(), FsError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|e| FsError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Atomically replace `path` with `bytes` via a temp sibling + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes).map_err(|e| FsError::io(&tmp, e))?;
    restrict_mode(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        FsError::io(path, e)
    })?;
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically write it to `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| FsError::json(path, e))?;
    write_atomic(path, &bytes)
}

/// Read and deserialize a JSON file. `Ok(None)` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FsError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::io(path, e)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| FsError::json(path, e))?;
    Ok(Some(value))
}

/// Read a JSON file, quarantining an unreadable one to `<path>.corrupt-<ts>`
/// and returning `None` so the caller falls back to defaults.
pub fn read_json_or_quarantine<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match read_json(path) {
        Ok(v) => v,
        Err(e) => {
            let backup = path.with_file_name(format!(
                "{}.corrupt-{}",
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "state".to_string()),
                chrono::Utc::now().timestamp_millis()
            ));
            tracing::warn!(
                "unreadable state file {}: {}; moving to {}",
                path.display(),
                e,
                backup.display()
            );
            let _ = std::fs::rename(path, &backup);
            None
        }
    }
}

/// Append a single line to a file, creating it (0600) if needed.
pub fn append_line(path: &Path, line: &str) -> Result<(), FsError> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let existed = path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FsError::io(path, e))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| FsError::io(path, e))?;
    if !existed {
        restrict_mode(path)?;
    }
    Ok(())
}

/// Append a serialized JSON value as one JSONL line.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let line = serde_json::to_string(value).map_err(|e| FsError::json(path, e))?;
    append_line(path, &line)
}

/// Read every parseable line of a JSONL file. Unparseable lines are skipped
/// with a warning so one bad record cannot take down the whole log.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, FsError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FsError::io(path, e)),
    };
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::warn!("skipping bad line {} in {}: {}", idx + 1, path.display(), e);
            }
        }
    }
    Ok(out)
}

/// Recursively collect files under `root` whose extension matches `ext`
/// (case-insensitive), sorted by path for stable iteration order.
pub fn walk_files(root: &Path, ext: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(ext))
                .unwrap_or(false)
            {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// Read a text file, returning an empty string when it does not exist.
pub fn read_text_or_empty(path: &Path) -> Result<String, FsError> {
    match std::fs::read_to_string(path) {
        Ok(t) => Ok(t),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(FsError::io(path, e)),
    }
}

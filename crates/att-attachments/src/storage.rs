//! Filesystem primitives
//!
//! Publishing a file is always "write a sibling, then rename", so readers of
//! a partition directory never observe a partially written file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Create `dir` and its parents; concurrent creators do not fail each other
pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    match fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Hidden, unique sibling of `target`; keeps the extension so tools can
/// infer the output format from it
pub fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}", Uuid::new_v4().simple(), name))
}

/// Whether `name` is one of our in-flight temp files
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.len() > 34 && name.as_bytes()[33] == b'.'
}

/// Copy `source` to `target` through a temp sibling and rename into place
pub async fn commit_copy(source: &Path, target: &Path) -> std::io::Result<u64> {
    if let Some(parent) = target.parent() {
        ensure_dir(parent).await?;
    }

    let temp = temp_sibling(target);
    let copied = match fs::copy(source, &temp).await {
        Ok(n) => n,
        Err(e) => {
            remove_file_quietly(&temp).await;
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&temp, target).await {
        warn!(from = %temp.display(), to = %target.display(), error = %e, "rename failed");
        remove_file_quietly(&temp).await;
        return Err(e);
    }

    debug!(path = %target.display(), size = copied, "File committed");
    Ok(copied)
}

/// Apply a unix mode; no-op elsewhere
pub async fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Read a whole file, `None` when it is not there
pub async fn read_if_exists(path: &Path) -> std::io::Result<Option<Bytes>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success
pub async fn remove_file(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub async fn remove_file_quietly(path: &Path) {
    if let Err(e) = remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Could not remove temp file");
    }
}

/// Remove a directory tree, treating "already gone" as success
pub async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Outcome of [`remove_except`]
#[derive(Debug, Default)]
pub struct Removal {
    pub removed: usize,
    pub failures: Vec<(PathBuf, std::io::Error)>,
}

/// Remove every regular file in `dir` except `keep`.
///
/// Keeps going after individual failures and reports them all.
pub async fn remove_except(dir: &Path, keep: Option<&Path>) -> Removal {
    let mut removal = Removal::default();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return removal,
        Err(e) => {
            removal.failures.push((dir.to_path_buf(), e));
            return removal;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                removal.failures.push((dir.to_path_buf(), e));
                break;
            }
        };

        let path = entry.path();
        if keep == Some(path.as_path()) {
            continue;
        }
        match entry.file_type().await {
            Ok(ft) if ft.is_dir() => continue,
            Ok(_) => {}
            Err(e) => {
                removal.failures.push((path, e));
                continue;
            }
        }
        match remove_file(&path).await {
            Ok(()) => removal.removed += 1,
            Err(e) => removal.failures.push((path, e)),
        }
    }

    removal
}

//! Atomic filesystem primitives for checkpoints and the best pointer.
//!
//! Every write lands in a uniquely named sibling first and is then renamed over
//! the target, so readers observe either the old file or the new one.

use std::io;
use std::path::{Path, PathBuf};

/// Atomically write `data` as pretty JSON. Creates parent directories.
pub fn atomic_write_json<T: serde::Serialize + ?Sized>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

/// Atomically write raw bytes. Creates parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = staging_path(path);
    if let Err(e) = std::fs::write(&tmp, data) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path)
}

/// Load and deserialize JSON. Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value =
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Atomically point `link` at `target`.
///
/// `target` is stored as given, so a bare file name resolves relative to the
/// link's own directory. On Unix a symlink is staged and renamed over `link`;
/// elsewhere the target's bytes are copied through [`atomic_write`].
pub fn replace_link(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let tmp = staging_path(link);
        std::os::unix::fs::symlink(target, &tmp)?;
        if let Err(e) = std::fs::rename(&tmp, link) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let source = match link.parent() {
            Some(dir) if target.is_relative() => dir.join(target),
            _ => target.to_path_buf(),
        };
        let data = std::fs::read(source)?;
        atomic_write(link, &data)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

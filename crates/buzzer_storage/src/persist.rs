#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::StorageError;

/// Writes `value` next to `path` and renames it into place, so readers never
/// observe a half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            StorageError::persistence(path, format!("failed to create directory: {err}"))
        })?;
    }
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| StorageError::persistence(path, format!("encode failed: {err}")))?;
    let tmp = tmp_path(path);
    let mut file = File::create(&tmp)
        .map_err(|err| StorageError::persistence(path, format!("create temp failed: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.sync_all())
        .map_err(|err| StorageError::persistence(path, format!("write failed: {err}")))?;
    fs::rename(&tmp, path)
        .map_err(|err| StorageError::persistence(path, format!("rename failed: {err}")))?;
    Ok(())
}

pub(crate) fn read_json_if_exists<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StorageError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StorageError::persistence(path, format!("read failed: {err}"))),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|err| StorageError::persistence(path, format!("decode failed: {err}")))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

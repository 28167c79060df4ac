use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

const TEMP_FILE_SUFFIX: &str = ".tmp";

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes).map_err(|e| Error::persistence(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::persistence(path, e))?;
    Ok(())
}

pub fn save_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::persistence(path, e))?;
    write_atomic(path, &bytes)
}

/// A missing file is not an error: every store starts empty on first run.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::persistence(path, e)),
    };
    let value = serde_json::from_str(&text).map_err(|e| Error::persistence(path, e))?;
    Ok(Some(value))
}

//! JSON documents under the console's local data directory.

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use serde::{
    de::DeserializeOwned,
    Serialize,
};
use tracing::{
    debug,
    warn,
};

use crate::core::ConsoleError;

const APP_NAME: &str = "chainfl";

/// `<local data dir>/chainfl`, created on demand.
pub fn data_dir() -> Result<PathBuf, ConsoleError> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| ConsoleError::Custom("no local data directory available".to_string()))?;
    let dir = base.join(APP_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Read a document. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConsoleError> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let data = serde_json::from_str(&json)?;
    debug!(path = %path.display(), "Loaded");
    Ok(Some(data))
}

/// Read a document, falling back to `T::default()` when it is missing or unreadable.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(data)) => data,
        Ok(None) => T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load, using defaults");
            T::default()
        }
    }
}

/// Write through a sibling temp file and rename it over the target.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), ConsoleError> {
    let json = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Saved");
    Ok(())
}

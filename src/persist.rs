//! Atomic JSON persistence helpers.
//!
//! Every JSON state file (caches, entities, graph, metrics) follows the same
//! discipline: write to a `.tmp` sibling, then atomically rename over the
//! target. Corrupt files are logged and treated as empty so a bad shutdown
//! never takes the process down.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Loads a JSON state file, returning `T::default()` when the file is
/// missing or unreadable.
///
/// Corruption is logged, the bad file is left in place for inspection, and
/// an empty value is returned so callers can reinitialize.
pub fn load_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return T::default();
    }

    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt state file, reinitializing empty");
                T::default()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable state file, reinitializing empty");
            T::default()
        }
    }
}

/// Saves a value as JSON via write-temp then atomic rename.
///
/// The parent directory is created if needed.
///
/// # Errors
///
/// Returns an error if serialization or any filesystem step fails.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_string(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

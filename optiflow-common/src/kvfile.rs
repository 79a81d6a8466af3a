//! Readers for the `key=value` line format used by the parameters file and
//! by the terminal stage's objectives file.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Error;

/// Strict reader for the terminal objectives file: every line must be
/// `key=value`; empty and comment lines are invalid here.
pub fn read_key_value_file(path: &Path) -> Result<HashMap<String, String>, Error> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("failed to open {}: {e}", path.display())))?;
    let mut map = HashMap::new();
    for line in data.lines() {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::Internal(format!("invalid line: {line}")))?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// Lenient reader for the parameters file: empty lines and `#` comment
/// lines are skipped. Comments are supported only on separate lines.
pub fn read_parameters_file(path: &Path) -> Result<HashMap<String, String>, Error> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to open {}: {e}", path.display())))?;
    let mut map = HashMap::new();
    for line in data.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::Config(format!(
                "invalid line: {line} (btw, comments are supported only on separate lines)"
            ))
        })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

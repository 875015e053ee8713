//! `/etc/shadow` parser.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::ParseError;

/// One shadow entry: the account name and its password hash field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub username: String,
    pub password: String,
}

/// Parse a shadow file. Lines without at least name and password fields
/// are logged and skipped.
pub fn parse(path: &Path) -> Result<Vec<ShadowEntry>, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ParseError::io(path, e))?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(':');
        let (username, password) = match (fields.next(), fields.next()) {
            (Some(u), Some(p)) => (u.trim().to_string(), p.trim().to_string()),
            _ => {
                tracing::error!(file = %path.display(), "malformed shadow line, skipping");
                continue;
            }
        };
        entries.push(ShadowEntry { username, password });
    }
    Ok(entries)
}

/// True for password fields that mean "no usable password": empty or one
/// of the conventional locked markers.
pub fn is_locked(password: &str) -> bool {
    matches!(password, "" | "!" | "!!" | "*")
}

//! `/etc/passwd` parser.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::ParseError;

/// One passwd entry. Only the fields the users consumer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub username: String,
    pub home: String,
    pub shell: String,
}

/// Parse a passwd file. Lines without the full seven fields are logged
/// and skipped.
pub fn parse(path: &Path) -> Result<Vec<PasswdEntry>, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ParseError::io(path, e))?;
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            tracing::error!(file = %path.display(), "malformed passwd line, skipping");
            continue;
        }
        entries.push(PasswdEntry {
            username: fields[0].trim().to_string(),
            home: fields[5].trim().to_string(),
            shell: fields[6].trim().to_string(),
        });
    }
    Ok(entries)
}

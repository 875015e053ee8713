//! Parser for `/etc/security/access.conf` style files.
//!
//! Each non-comment line is `permission : users : origins`. Only the
//! permission (`+` grant, `-` deny) and the user field matter for
//! integrity tracking; the origins tail is tolerated, including embedded
//! `:` separators and trailing `#` comments.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{util::symmetric_diff, ParseError};

/// Grant and deny entries of an access.conf file, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntries {
    #[serde(default)]
    pub grant: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl AccessEntries {
    pub fn is_empty(&self) -> bool {
        self.grant.is_empty() && self.deny.is_empty()
    }

    /// Entries present in `next` but not `self`, and vice versa.
    pub fn diff(&self, next: &AccessEntries) -> (AccessEntries, AccessEntries) {
        let (grant_add, grant_del) = symmetric_diff(&self.grant, &next.grant);
        let (deny_add, deny_del) = symmetric_diff(&self.deny, &next.deny);
        (
            AccessEntries {
                grant: grant_add,
                deny: deny_add,
            },
            AccessEntries {
                grant: grant_del,
                deny: deny_del,
            },
        )
    }
}

/// Parse an access.conf file into its grant/deny lists.
///
/// Comment and blank lines are skipped; a line whose permission field is
/// neither `+` nor `-` is reported and skipped rather than failing the
/// whole parse.
pub fn parse(path: &Path) -> Result<AccessEntries, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let mut entries = AccessEntries::default();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ParseError::io(path, e))?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, ':');
        let permission = fields.next().unwrap_or_default().trim();
        let name = fields.next().unwrap_or_default().trim().to_string();
        match permission {
            "+" => entries.grant.push(name),
            "-" => entries.deny.push(name),
            other => {
                tracing::error!(
                    file = %path.display(),
                    entry = other,
                    "unexpected access entry, skipping line"
                );
            }
        }
    }
    Ok(entries)
}

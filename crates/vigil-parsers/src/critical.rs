//! Line-diffed parser for whitelisted critical files (sudoers drop-ins
//! and the like).

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{util::symmetric_diff, ParseError};

/// The meaningful lines of a critical file, in file order.
///
/// An existing-but-empty file parses to a single-space sentinel rule so
/// that "created empty" can be told apart from "deleted" by looking at
/// the previous state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalRules {
    #[serde(default)]
    pub rules: Vec<String>,
}

impl CriticalRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn diff(&self, next: &CriticalRules) -> (CriticalRules, CriticalRules) {
        let (add, del) = symmetric_diff(&self.rules, &next.rules);
        (CriticalRules { rules: add }, CriticalRules { rules: del })
    }
}

/// Parse a critical file into its rule lines, skipping comments and
/// blanks.
pub fn parse(path: &Path) -> Result<CriticalRules, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let len = file
        .metadata()
        .map_err(|e| ParseError::io(path, e))?
        .len();
    let mut rules = CriticalRules::default();
    if len == 0 {
        rules.rules.push(" ".to_string());
        return Ok(rules);
    }
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ParseError::io(path, e))?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rules.rules.push(line);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_fixture(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_file_yields_sentinel() {
        let f = write_fixture("");
        let rules = parse(f.path()).unwrap();
        assert_eq!(rules.rules, vec![" "]);
        assert!(!rules.is_empty());
    }

    #[test]
    fn keeps_rule_lines_in_order() {
        let f = write_fixture("# comment\nroot ALL=(ALL) ALL\n\n%wheel ALL=(ALL) ALL\n");
        let rules = parse(f.path()).unwrap();
        assert_eq!(rules.rules, vec!["root ALL=(ALL) ALL", "%wheel ALL=(ALL) ALL"]);
    }

    #[test]
    fn sentinel_diffs_against_content() {
        let empty = parse(write_fixture("").path()).unwrap();
        let filled = parse(write_fixture("root ALL=(ALL) ALL\n").path()).unwrap();
        let (add, del) = empty.diff(&filled);
        assert_eq!(add.rules, vec!["root ALL=(ALL) ALL"]);
        assert_eq!(del.rules, vec![" "]);
    }

    #[test]
    fn diff_empty_iff_equal() {
        let a = parse(write_fixture("one\ntwo\n").path()).unwrap();
        let b = parse(write_fixture("two\none\n").path()).unwrap();
        let (add, del) = a.diff(&b);
        assert!(add.is_empty() && del.is_empty());
    }
}

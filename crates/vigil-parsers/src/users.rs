//! Combined account view over passwd, shadow and per-user
//! `authorized_keys` files.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{passwd, shadow, util::mask_left};

const KEY_PREFIX: &str = "ssh-rsa ";

/// A tracked account: name, left-masked password hash and SSH keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Accounts by name. BTreeMap so notifications list users in a stable
/// order.
pub type UsersTable = BTreeMap<String, User>;

/// Parse passwd and shadow into a [`UsersTable`].
///
/// Accounts with shell `/sbin/nologin` are dropped. Accounts whose
/// shadow password is locked are kept only if they own SSH keys. The
/// second return value is the include list: the `authorized_keys` path
/// derived from every surviving passwd home, in passwd order. `root`
/// rebases home-derived paths the same way the configured consumer paths
/// are rebased.
pub fn parse(
    passwd_path: &Path,
    shadow_path: &Path,
    root: Option<&Path>,
) -> Result<(UsersTable, Vec<PathBuf>), crate::ParseError> {
    let mut passwords: BTreeMap<String, String> = BTreeMap::new();
    for entry in shadow::parse(shadow_path)? {
        if shadow::is_locked(&entry.password) {
            continue;
        }
        passwords.insert(entry.username, mask_left(&entry.password));
    }

    let mut users = UsersTable::new();
    let mut includes = Vec::new();
    for entry in passwd::parse(passwd_path)? {
        if entry.shell == "/sbin/nologin" {
            continue;
        }
        let authorized = rebase(root, Path::new(&entry.home)).join(".ssh/authorized_keys");
        let keys = read_keys(&authorized);
        includes.push(authorized);
        let password = passwords.get(&entry.username).cloned();
        if password.is_some() || !keys.is_empty() {
            users.insert(
                entry.username.clone(),
                User {
                    name: entry.username,
                    password: password.unwrap_or_default(),
                    keys,
                },
            );
        }
    }
    Ok((users, includes))
}

fn rebase(root: Option<&Path>, path: &Path) -> PathBuf {
    match root {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    }
}

/// Extract SSH keys from an authorized_keys file: for every line
/// containing `ssh-rsa `, the text after the marker. A missing or
/// unreadable file yields no keys.
pub fn read_keys(path: &Path) -> Vec<String> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let mut keys = Vec::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if let Some(idx) = line.find(KEY_PREFIX) {
            keys.push(line[idx + KEY_PREFIX.len()..].to_string());
        }
    }
    keys
}

/// Entries added and removed between two tables.
///
/// A user counts as changed when the (name, masked password, ordered key
/// list) triple differs; it then shows up in both maps under its name.
pub fn diff(old: &UsersTable, new: &UsersTable) -> (UsersTable, UsersTable) {
    let mut add = UsersTable::new();
    let mut del = UsersTable::new();
    for (name, user) in new {
        if old.get(name) != Some(user) {
            add.insert(name.clone(), user.clone());
        }
    }
    for (name, user) in old {
        if new.get(name) != Some(user) {
            del.insert(name.clone(), user.clone());
        }
    }
    (add, del)
}

//! Consumer state for the account database: passwd + shadow + every
//! discovered `authorized_keys` file.

use std::{mem, path::PathBuf};

use serde::Serialize;
use vigil_parsers::{set_equal, users, UsersTable};
use vigil_store::StateDb;

use super::{ConsumerError, Control, FileState};
use crate::notify::Notifier;

/// Keys longer than this are shown by their tail only; enough to tell
/// keys apart without flooding the log stream.
const KEY_DISPLAY_MAX: usize = 80;

#[derive(Default, Clone)]
struct Snapshot {
    users: UsersTable,
    includes: Vec<PathBuf>,
}

pub struct UsersState {
    passwd: PathBuf,
    shadow: PathBuf,
    root: Option<PathBuf>,
    current: Snapshot,
    next: Snapshot,
}

impl UsersState {
    pub fn new(passwd: PathBuf, shadow: PathBuf, root: Option<PathBuf>) -> UsersState {
        UsersState {
            passwd,
            shadow,
            root,
            current: Snapshot::default(),
            next: Snapshot::default(),
        }
    }
}

#[derive(Serialize)]
struct LogUser {
    user: String,
    passwd: String,
    keys: Vec<String>,
}

#[derive(Serialize)]
struct UsersPayload {
    users: Vec<LogUser>,
    add: Vec<LogUser>,
    del: Vec<LogUser>,
}

fn log_users(users: &UsersTable) -> Vec<LogUser> {
    users
        .values()
        .map(|u| LogUser {
            user: u.name.clone(),
            passwd: u.password.clone(),
            keys: u.keys.iter().map(|k| truncate_key(k)).collect(),
        })
        .collect()
}

fn truncate_key(key: &str) -> String {
    if key.len() <= KEY_DISPLAY_MAX {
        return key.to_string();
    }
    // Keys are base64, so byte offsets are char boundaries.
    key[key.len() - KEY_DISPLAY_MAX..].to_string()
}

impl FileState for UsersState {
    fn load(&mut self, db: &StateDb) -> Result<(), ConsumerError> {
        self.current = Snapshot {
            users: db.load_users()?,
            includes: Vec::new(),
        };
        Ok(())
    }

    fn save(&self, db: &StateDb) -> Result<(), ConsumerError> {
        tracing::debug!(users = self.next.users.len(), "save users");
        db.save_users(&self.next.users)?;
        Ok(())
    }

    fn parse(&mut self) -> Result<(), ConsumerError> {
        let (users, includes) = users::parse(&self.passwd, &self.shadow, self.root.as_deref())?;
        self.next = Snapshot { users, includes };
        Ok(())
    }

    fn changed(&self) -> bool {
        let (add, del) = users::diff(&self.current.users, &self.next.users);
        !add.is_empty() || !del.is_empty()
    }

    fn created(&self) -> bool {
        self.current.users.is_empty()
    }

    fn notify(&self, notifier: &Notifier, process: &str, user: &str) {
        let (add, del) = users::diff(&self.current.users, &self.next.users);
        notifier.warn(
            &UsersPayload {
                users: log_users(&self.next.users),
                add: log_users(&add),
                del: log_users(&del),
            },
            process,
            user,
            "Users Modified",
        );
    }

    fn teardown(&mut self) -> Control {
        let includes_changed = !self.current.includes.is_empty()
            && !set_equal(
                &path_strings(&self.current.includes),
                &path_strings(&self.next.includes),
            );
        if includes_changed {
            tracing::debug!(
                old = ?self.current.includes,
                new = ?self.next.includes,
                "includes changed"
            );
        }
        self.current = mem::take(&mut self.next);
        if includes_changed {
            Control::Reload
        } else {
            Control::Keep
        }
    }

    fn register(&self) -> Vec<PathBuf> {
        let mut seen = std::collections::HashSet::new();
        self.current
            .includes
            .iter()
            .cloned()
            .chain([self.passwd.clone(), self.shadow.clone()])
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }
}

fn path_strings(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect()
}

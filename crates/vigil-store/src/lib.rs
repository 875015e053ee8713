//! Persistent consumer state.
//!
//! A single-file transactional key-value store holding the last
//! persisted value of every consumer category. The values survive agent
//! restarts so the first parse after a cold start is diffed against the
//! state from the previous run, surfacing changes made while the agent
//! was down.
//!
//! Values are serde_json blobs with defaulted fields, so adding a field
//! to a state struct keeps old databases readable. The four key names
//! are part of the on-disk contract and must stay stable across
//! versions.

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use vigil_parsers::{AccessEntries, CriticalRules, EncryptedDigest, UsersTable};

const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

pub const USERS_KEY: &str = "users";
pub const ACCESS_KEY: &str = "access";
pub const GENERIC_KEY: &str = "generic";
pub const GENERIC_DIFF_KEY: &str = "generic_diff";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("opening database")]
    Open(#[from] redb::DatabaseError),
    #[error("starting transaction")]
    Transaction(#[from] redb::TransactionError),
    #[error("opening state table")]
    Table(#[from] redb::TableError),
    #[error("accessing state table")]
    Storage(#[from] redb::StorageError),
    #[error("committing transaction")]
    Commit(#[from] redb::CommitError),
    #[error("encoding state blob")]
    Codec(#[from] serde_json::Error),
    #[error("restricting database permissions")]
    Permissions(#[source] std::io::Error),
}

/// Handle to the agent state database. Cheap to share behind an `Arc`;
/// redb serializes writers internally.
pub struct StateDb {
    db: Database,
}

impl StateDb {
    /// Open (or create) the database file and restrict it to the owner.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(StoreError::Permissions)?;
        // Create the table up front so reads never see a missing table.
        let txn = db.begin_write()?;
        txn.open_table(STATE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    fn put(&self, key: &str, blob: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE)?;
            table.insert(key, blob)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        tracing::debug!(key, "saving state");
        self.put(key, &serde_json::to_vec(value)?)
    }

    /// Load a value; an absent key is the zero value, not an error.
    fn load<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StoreError> {
        tracing::debug!(key, "loading state");
        match self.get(key)? {
            Some(blob) => Ok(serde_json::from_slice(&blob)?),
            None => Ok(T::default()),
        }
    }

    pub fn save_users(&self, users: &UsersTable) -> Result<(), StoreError> {
        self.save(USERS_KEY, users)
    }

    pub fn load_users(&self) -> Result<UsersTable, StoreError> {
        self.load(USERS_KEY)
    }

    pub fn save_access(&self, access: &AccessEntries) -> Result<(), StoreError> {
        self.save(ACCESS_KEY, access)
    }

    pub fn load_access(&self) -> Result<AccessEntries, StoreError> {
        self.load(ACCESS_KEY)
    }

    pub fn save_generic(&self, digest: &EncryptedDigest) -> Result<(), StoreError> {
        self.save(GENERIC_KEY, digest)
    }

    pub fn load_generic(&self) -> Result<EncryptedDigest, StoreError> {
        self.load(GENERIC_KEY)
    }

    pub fn save_critical(&self, rules: &CriticalRules) -> Result<(), StoreError> {
        self.save(GENERIC_DIFF_KEY, rules)
    }

    pub fn load_critical(&self) -> Result<CriticalRules, StoreError> {
        self.load(GENERIC_DIFF_KEY)
    }
}

#[cfg(test)]
mod tests {
    use vigil_parsers::User;

    use super::*;

    fn open_db(dir: &tempfile::TempDir) -> StateDb {
        StateDb::open(&dir.path().join("state.db")).unwrap()
    }

    #[test]
    fn absent_keys_load_zero_values() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        assert!(db.load_users().unwrap().is_empty());
        assert!(db.load_access().unwrap().is_empty());
        assert!(db.load_generic().unwrap().is_empty());
        assert!(db.load_critical().unwrap().is_empty());
    }

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        let mut users = UsersTable::new();
        users.insert(
            "root".into(),
            User {
                name: "root".into(),
                password: "XXXXword".into(),
                keys: vec!["AAAA".into()],
            },
        );
        db.save_users(&users).unwrap();
        assert_eq!(db.load_users().unwrap(), users);

        let access = AccessEntries {
            grant: vec!["john".into()],
            deny: vec!["ALL".into()],
        };
        db.save_access(&access).unwrap();
        assert_eq!(db.load_access().unwrap(), access);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let rules = CriticalRules {
            rules: vec!["root ALL=(ALL) ALL".into()],
        };
        StateDb::open(&path).unwrap().save_critical(&rules).unwrap();
        assert_eq!(StateDb::open(&path).unwrap().load_critical().unwrap(), rules);
    }

    #[test]
    fn database_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        StateDb::open(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

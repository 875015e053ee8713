//! Consumer state for generic files, tracked by encrypted content hash.

use std::{mem, path::PathBuf};

use serde::Serialize;
use vigil_parsers::{
    digest::{self, KEY_LEN},
    EncryptedDigest,
};
use vigil_store::StateDb;

use super::{ConsumerError, Control, FileState};
use crate::notify::Notifier;

pub struct GenericState {
    file: PathBuf,
    is_dir: bool,
    key: [u8; KEY_LEN],
    current: EncryptedDigest,
    next: EncryptedDigest,
}

impl GenericState {
    pub fn new(file: PathBuf, is_dir: bool, key: [u8; KEY_LEN]) -> GenericState {
        GenericState {
            file,
            is_dir,
            key,
            current: EncryptedDigest::default(),
            next: EncryptedDigest::default(),
        }
    }
}

#[derive(Serialize)]
struct DigestPair {
    current: String,
    next: String,
}

#[derive(Serialize)]
struct GenericPayload {
    generic: DigestPair,
    file: String,
}

impl FileState for GenericState {
    fn load(&mut self, db: &StateDb) -> Result<(), ConsumerError> {
        self.current = db.load_generic()?;
        Ok(())
    }

    fn save(&self, db: &StateDb) -> Result<(), ConsumerError> {
        tracing::debug!(file = %self.file.display(), "save generic file");
        db.save_generic(&self.next)?;
        Ok(())
    }

    fn parse(&mut self) -> Result<(), ConsumerError> {
        tracing::debug!(file = %self.file.display(), "hashing generic file");
        if self.is_dir {
            self.next = EncryptedDigest::default();
            return Ok(());
        }
        match digest::digest_file(&self.file, &self.key) {
            Ok(digest) => self.next = digest,
            // Deleted: the empty digest drives the delete notification.
            Err(e) if e.is_not_found() => self.next = EncryptedDigest::default(),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn changed(&self) -> bool {
        if self.next.is_empty() {
            return !self.current.is_empty();
        }
        self.current != self.next
    }

    fn created(&self) -> bool {
        self.current.is_empty()
    }

    fn notify(&self, notifier: &Notifier, process: &str, user: &str) {
        let message = if self.current.is_empty() {
            "generic file created"
        } else if self.next.is_empty() {
            "generic file deleted"
        } else {
            "generic file Modified"
        };
        notifier.warn(
            &GenericPayload {
                generic: DigestPair {
                    current: self.current.to_hex(),
                    next: self.next.to_hex(),
                },
                file: self.file.display().to_string(),
            },
            process,
            user,
            message,
        );
    }

    fn teardown(&mut self) -> Control {
        self.current = mem::take(&mut self.next);
        Control::Keep
    }

    fn register(&self) -> Vec<PathBuf> {
        vec![self.file.clone()]
    }
}

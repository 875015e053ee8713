//! Consumer state for the access.conf grant/deny list.

use std::path::PathBuf;

use serde::Serialize;
use vigil_parsers::{access, AccessEntries};
use vigil_store::StateDb;

use super::{ConsumerError, Control, FileState};
use crate::notify::Notifier;

pub struct AccessState {
    file: PathBuf,
    current: AccessEntries,
    next: AccessEntries,
}

impl AccessState {
    pub fn new(file: PathBuf) -> AccessState {
        AccessState {
            file,
            current: AccessEntries::default(),
            next: AccessEntries::default(),
        }
    }
}

#[derive(Serialize)]
struct AccessPayload<'a> {
    access: &'a AccessEntries,
    add: AccessEntries,
    del: AccessEntries,
}

impl FileState for AccessState {
    fn load(&mut self, db: &StateDb) -> Result<(), ConsumerError> {
        self.current = db.load_access()?;
        Ok(())
    }

    fn save(&self, db: &StateDb) -> Result<(), ConsumerError> {
        tracing::debug!(file = %self.file.display(), "save access");
        db.save_access(&self.next)?;
        Ok(())
    }

    fn parse(&mut self) -> Result<(), ConsumerError> {
        tracing::debug!(file = %self.file.display(), "parsing access");
        self.next = access::parse(&self.file)?;
        Ok(())
    }

    fn changed(&self) -> bool {
        let (add, del) = self.current.diff(&self.next);
        !add.is_empty() || !del.is_empty()
    }

    fn created(&self) -> bool {
        self.current.is_empty()
    }

    fn notify(&self, notifier: &Notifier, process: &str, user: &str) {
        let (add, del) = self.current.diff(&self.next);
        notifier.warn(
            &AccessPayload {
                access: &self.next,
                add,
                del,
            },
            process,
            user,
            "access entries",
        );
    }

    fn teardown(&mut self) -> Control {
        self.current = self.next.clone();
        Control::Keep
    }

    fn register(&self) -> Vec<PathBuf> {
        vec![self.file.clone()]
    }
}

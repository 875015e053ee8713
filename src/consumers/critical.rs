//! Consumer state for whitelisted critical files, diffed line by line.

use std::{mem, path::PathBuf};

use serde::Serialize;
use vigil_parsers::{critical, CriticalRules};
use vigil_store::StateDb;

use super::{ConsumerError, Control, FileState};
use crate::notify::Notifier;

pub struct CriticalState {
    file: PathBuf,
    current: CriticalRules,
    next: CriticalRules,
}

impl CriticalState {
    pub fn new(file: PathBuf) -> CriticalState {
        CriticalState {
            file,
            current: CriticalRules::default(),
            next: CriticalRules::default(),
        }
    }
}

#[derive(Serialize)]
struct Lines {
    #[serde(rename = "Content")]
    content: Vec<String>,
}

#[derive(Serialize)]
struct CriticalPayload {
    add: Lines,
    del: Lines,
    file: String,
}

impl FileState for CriticalState {
    fn load(&mut self, db: &StateDb) -> Result<(), ConsumerError> {
        self.current = db.load_critical()?;
        Ok(())
    }

    fn save(&self, db: &StateDb) -> Result<(), ConsumerError> {
        tracing::debug!(file = %self.file.display(), "save critical file");
        db.save_critical(&self.next)?;
        Ok(())
    }

    fn parse(&mut self) -> Result<(), ConsumerError> {
        tracing::debug!(file = %self.file.display(), "parsing critical file");
        match critical::parse(&self.file) {
            Ok(rules) => self.next = rules,
            // Deleted: the empty value flows through diff and teardown.
            Err(e) if e.is_not_found() => self.next = CriticalRules::default(),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn changed(&self) -> bool {
        if self.next.is_empty() && !self.current.is_empty() {
            return true;
        }
        let (add, del) = self.current.diff(&self.next);
        !add.is_empty() || !del.is_empty()
    }

    fn created(&self) -> bool {
        self.current.is_empty()
    }

    fn notify(&self, notifier: &Notifier, process: &str, user: &str) {
        let (add, del) = self.current.diff(&self.next);
        let message = if self.current.is_empty() {
            "Critical Generic file created"
        } else if self.next.is_empty() {
            "Critical Generic file deleted"
        } else {
            "Critical Generic file modified"
        };
        notifier.warn(
            &CriticalPayload {
                add: Lines { content: add.rules },
                del: Lines { content: del.rules },
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

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use vigil_bpf::{Event, EventKind};

    use super::*;
    use crate::{
        consumers::{BaseConsumer, Consumer},
        notify::capture,
    };

    fn event(kind: EventKind, path: &std::path::Path) -> Event {
        Event {
            kind,
            pid: 1,
            uid: 0,
            size: 0,
            inode: 3,
            device: 1,
            new_inode: 0,
            new_device: 0,
            command: "visudo".to_string(),
            path: path.to_path_buf(),
        }
    }

    #[test]
    fn lifecycle_created_modified_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sudoers.d-test");
        let db = Arc::new(StateDb::open(&dir.path().join("state.db")).unwrap());
        let (notifier, buffer) = capture::notifier();
        let consumer = BaseConsumer::new(db, notifier, CriticalState::new(path.clone()));
        consumer.init().unwrap();

        // Created empty: the sentinel line stands in for the content.
        fs::write(&path, "").unwrap();
        consumer.consume(&event(EventKind::FileCreate, &path)).unwrap();
        // Written.
        fs::write(&path, "root ALL=(ALL) ALL\n").unwrap();
        consumer.consume(&event(EventKind::Modify, &path)).unwrap();
        // Deleted.
        fs::remove_file(&path).unwrap();
        consumer.consume(&event(EventKind::DeleteFile, &path)).unwrap();

        let records = buffer.records();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0]["message"], "Critical Generic file created");
        assert_eq!(records[0]["add"]["Content"], serde_json::json!([" "]));

        assert_eq!(records[1]["message"], "Critical Generic file modified");
        assert_eq!(
            records[1]["add"]["Content"],
            serde_json::json!(["root ALL=(ALL) ALL"])
        );
        assert_eq!(records[1]["del"]["Content"], serde_json::json!([" "]));

        assert_eq!(records[2]["message"], "Critical Generic file deleted");
        assert_eq!(
            records[2]["del"]["Content"],
            serde_json::json!(["root ALL=(ALL) ALL"])
        );
        for record in &records {
            assert_eq!(record["file"], path.display().to_string());
            assert_eq!(record["processName"], "visudo");
        }
    }

    #[test]
    fn comment_only_edit_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules");
        fs::write(&path, "root ALL=(ALL) ALL\n").unwrap();
        let db = Arc::new(StateDb::open(&dir.path().join("state.db")).unwrap());
        let (notifier, buffer) = capture::notifier();
        let consumer = BaseConsumer::new(db, notifier, CriticalState::new(path.clone()));
        consumer.init().unwrap();

        fs::write(&path, "# reviewed 2024-02\nroot ALL=(ALL) ALL\n").unwrap();
        consumer.consume(&event(EventKind::Modify, &path)).unwrap();
        assert!(buffer.records().is_empty());
    }
}

//! Per-path consumers: the parse → diff → persist → notify pipeline.
//!
//! Every watched path belongs to exactly one consumer. A consumer owns a
//! [`FileState`] — the current and freshly-parsed value of its file
//! category — behind its own lock, so two events on the same path can
//! never interleave a parse with a save. The four categories (access,
//! users, critical, generic) differ only in what they parse, how they
//! detect a change and what they log; [`BaseConsumer`] supplies the
//! shared lifecycle.

use std::{path::PathBuf, sync::Arc};

use nix::unistd::{Uid, User};
use parking_lot::Mutex;
use thiserror::Error;
use vigil_bpf::Event;
use vigil_parsers::ParseError;
use vigil_store::{StateDb, StoreError};

use crate::notify::Notifier;

mod access;
mod critical;
mod generic;
mod users;

pub use access::AccessState;
pub use critical::CriticalState;
pub use generic::GenericState;
pub use users::UsersState;

/// Synthetic process name used for notifications emitted while
/// reconciling state at startup.
const INIT_PROCESS: &str = "baseInit";

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("consumer panicked")]
    Panicked,
}

/// What the dispatch loop should do after a consume: nothing, or
/// reconcile this consumer's registrations because its watch-set
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Keep,
    Reload,
}

/// Category-specific state machine: `current` is the last persisted
/// value, `next` holds a fresh parse until teardown promotes it.
pub trait FileState: Send {
    fn load(&mut self, db: &StateDb) -> Result<(), ConsumerError>;
    fn save(&self, db: &StateDb) -> Result<(), ConsumerError>;
    /// Re-parse the file into `next`. A missing file is not an error for
    /// categories that can observe deletion; it parses to the empty
    /// value.
    fn parse(&mut self) -> Result<(), ConsumerError>;
    fn changed(&self) -> bool;
    /// True when no content had been seen before this parse.
    fn created(&self) -> bool;
    fn notify(&self, notifier: &Notifier, process: &str, user: &str);
    /// Promote `next` to `current`; reports whether the watch-set
    /// derived from the parsed content changed.
    fn teardown(&mut self) -> Control;
    /// The paths this state wants watched right now.
    fn register(&self) -> Vec<PathBuf>;
}

/// Object-safe consumer contract the watcher dispatches on.
pub trait Consumer: Send + Sync {
    fn init(&self) -> Result<Control, ConsumerError>;
    fn consume(&self, event: &Event) -> Result<Control, ConsumerError>;
    fn register(&self) -> Vec<PathBuf>;
}

pub struct BaseConsumer<S: FileState> {
    db: Arc<StateDb>,
    notifier: Arc<Notifier>,
    state: Mutex<S>,
}

impl<S: FileState> BaseConsumer<S> {
    pub fn new(db: Arc<StateDb>, notifier: Arc<Notifier>, state: S) -> BaseConsumer<S> {
        BaseConsumer {
            db,
            notifier,
            state: Mutex::new(state),
        }
    }
}

impl<S: FileState> Consumer for BaseConsumer<S> {
    /// Reconcile against the state persisted by the previous run: parse
    /// the file as it is now and report the difference as a change made
    /// while the agent was down.
    fn init(&self) -> Result<Control, ConsumerError> {
        let mut state = self.state.lock();
        state.load(&self.db)?;
        state.parse()?;
        if state.changed() && !state.created() {
            state.notify(&self.notifier, INIT_PROCESS, "");
        }
        state.save(&self.db)?;
        Ok(state.teardown())
    }

    fn consume(&self, event: &Event) -> Result<Control, ConsumerError> {
        let mut state = self.state.lock();
        state.parse()?;
        if !state.changed() {
            return Ok(state.teardown());
        }
        let user = resolve_user(event.uid);
        state.notify(&self.notifier, &event.command, &user);
        state.save(&self.db)?;
        Ok(state.teardown())
    }

    fn register(&self) -> Vec<PathBuf> {
        self.state.lock().register()
    }
}

/// Resolve a uid to its account name, falling back to the numeric form
/// for uids with no passwd entry.
fn resolve_user(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        Ok(None) => uid.to_string(),
        Err(e) => {
            tracing::debug!(uid, error = %e, "uid lookup failed");
            uid.to_string()
        }
    }
}

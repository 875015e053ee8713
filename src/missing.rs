//! Poller for configured paths that do not exist yet.
//!
//! A consumer whose file is missing cannot be armed in the kernel, so
//! its path is parked here: a task polls until the path appears, then
//! injects a synthetic creation event and exits. The dispatch loop
//! reacts by promoting the path to a real kernel watch; until then this
//! wrapper answers `register()` for the parked path and forwards
//! consumes to the real consumer.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use vigil_bpf::Event;

use crate::consumers::{Consumer, ConsumerError, Control};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct MissingFileWatcher {
    path: PathBuf,
    inner: Arc<dyn Consumer>,
}

impl MissingFileWatcher {
    /// Park `path` and start polling for it. The synthetic event is sent
    /// on `tx` the first time the path stats successfully.
    pub fn spawn(
        path: PathBuf,
        inner: Arc<dyn Consumer>,
        tx: mpsc::Sender<Event>,
    ) -> Arc<MissingFileWatcher> {
        let watcher = Arc::new(MissingFileWatcher {
            path: path.clone(),
            inner,
        });
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            // The first tick fires immediately; skip it so a racing
            // create still goes through the normal poll cadence.
            tick.tick().await;
            loop {
                tick.tick().await;
                if std::fs::metadata(&path).is_ok() {
                    tracing::debug!(file = %path.display(), "missing file appeared");
                    let _ = tx.send(Event::synthetic_create(path)).await;
                    return;
                }
            }
        });
        watcher
    }
}

impl Consumer for MissingFileWatcher {
    fn init(&self) -> Result<Control, ConsumerError> {
        Ok(Control::Keep)
    }

    fn consume(&self, event: &Event) -> Result<Control, ConsumerError> {
        self.inner.consume(event)
    }

    fn register(&self) -> Vec<PathBuf> {
        if self.path.exists() {
            self.inner.register()
        } else {
            vec![self.path.clone()]
        }
    }
}

//! The dispatch loop: routes kernel events to consumers, keeps the
//! watch-set in sync across creations, renames and deletions, and
//! applies reload signals.
//!
//! All dispatch-map and watch-set mutation happens on the loop task;
//! per-event consume work runs on short-lived blocking tasks that report
//! back over an internal channel.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Result};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use vigil_bpf::{Event, EventKind, WatchSet};
use vigil_parsers::digest::KEY_LEN;
use vigil_store::StateDb;

use crate::{
    consumers::{BaseConsumer, Consumer, ConsumerError, Control, GenericState},
    missing::MissingFileWatcher,
    notify::Notifier,
    paths::ExcludeList,
};

struct DoneMsg {
    event: Event,
    consumer: Arc<dyn Consumer>,
    result: Result<Control, ConsumerError>,
}

enum Step {
    Event(Event),
    Done(DoneMsg),
    Shutdown,
}

/// Stops the dispatch loop. Dropping it without calling
/// [`ShutdownHandle::stop`] also stops the loop.
pub struct ShutdownHandle {
    tx: watch::Sender<()>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(());
    }
}

pub struct Watcher<W: WatchSet> {
    fim: W,
    rx_events: mpsc::Receiver<Event>,
    tx_events: mpsc::Sender<Event>,
    db: Arc<StateDb>,
    notifier: Arc<Notifier>,
    key: [u8; KEY_LEN],
    consumers: Vec<Arc<dyn Consumer>>,
    dispatch: HashMap<PathBuf, Arc<dyn Consumer>>,
    excludes: ExcludeList,
    rx_shutdown: watch::Receiver<()>,
    tx_done: mpsc::UnboundedSender<DoneMsg>,
    rx_done: mpsc::UnboundedReceiver<DoneMsg>,
}

impl<W: WatchSet> Watcher<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fim: W,
        rx_events: mpsc::Receiver<Event>,
        tx_events: mpsc::Sender<Event>,
        db: Arc<StateDb>,
        notifier: Arc<Notifier>,
        key: [u8; KEY_LEN],
        consumers: Vec<Arc<dyn Consumer>>,
        excludes: ExcludeList,
    ) -> (Watcher<W>, ShutdownHandle) {
        let (tx_shutdown, rx_shutdown) = watch::channel(());
        let (tx_done, rx_done) = mpsc::unbounded_channel();
        (
            Watcher {
                fim,
                rx_events,
                tx_events,
                db,
                notifier,
                key,
                consumers,
                dispatch: HashMap::new(),
                excludes,
                rx_shutdown,
                tx_done,
                rx_done,
            },
            ShutdownHandle { tx: tx_shutdown },
        )
    }

    /// Register every consumer and run the dispatch loop until shutdown.
    /// A panic escaping the loop is caught and the loop restarted once.
    pub async fn run(mut self) -> Result<()> {
        let mut restarted = false;
        loop {
            self.register_all();
            let outcome = AssertUnwindSafe(self.event_loop()).catch_unwind().await;
            match outcome {
                Ok(()) => {
                    self.fim.shutdown();
                    return Ok(());
                }
                Err(panic) => {
                    tracing::error!(panic = panic_message(&panic), "dispatch loop panicked");
                    if restarted {
                        self.fim.shutdown();
                        bail!("dispatch loop panicked twice, giving up");
                    }
                    restarted = true;
                }
            }
        }
    }

    fn register_all(&mut self) {
        tracing::debug!(consumers = self.consumers.len(), "registering consumers");
        for consumer in self.consumers.clone() {
            for path in consumer.register() {
                if self.excludes.matches(&path) {
                    tracing::debug!(file = %path.display(), "excluded from monitoring");
                    continue;
                }
                self.add_watch(path, consumer.clone());
            }
        }
        tracing::info!(watched = self.fim.watched_count(), "watch-set armed");
    }

    async fn event_loop(&mut self) {
        loop {
            let step = tokio::select! {
                _ = self.rx_shutdown.changed() => Step::Shutdown,
                msg = self.rx_done.recv() => match msg {
                    Some(msg) => Step::Done(msg),
                    None => continue,
                },
                event = self.rx_events.recv() => match event {
                    Some(event) => Step::Event(event),
                    None => Step::Shutdown,
                },
            };
            match step {
                Step::Shutdown => {
                    tracing::debug!("stopping watch");
                    return;
                }
                Step::Done(msg) => self.handle_done(msg),
                Step::Event(event) => self.handle_event(event),
            }
        }
    }

    fn handle_event(&mut self, mut event: Event) {
        match event.kind {
            EventKind::DirCreate => self.add_inode(&mut event, true),
            EventKind::FileCreate => {
                if event.is_synthetic() {
                    let path = event.path.clone();
                    self.promote_missing(&path);
                } else if self.fim.lookup(event.device).is_none() {
                    self.add_inode(&mut event, false);
                    // Carry the new file's identity for downstream lookups.
                    event.inode = event.device;
                } else {
                    tracing::debug!(inode = event.device, "duplicate create event");
                    return;
                }
            }
            EventKind::Rename => {
                if let Err(e) = self.handle_rename(&mut event) {
                    tracing::error!(error = %e, "unable to handle rename properly");
                }
            }
            EventKind::Modify | EventKind::DeleteFile | EventKind::DeleteDir => {}
        }
        tracing::debug!(file = %event.path.display(), kind = ?event.kind, "event caught");

        let Some(consumer) = lookup_consumer(&self.dispatch, &event.path) else {
            tracing::error!(file = %event.path.display(), "no consumer found");
            return;
        };
        let tx_done = self.tx_done.clone();
        tokio::spawn(async move {
            let result = {
                let consumer = consumer.clone();
                let event = event.clone();
                tokio::task::spawn_blocking(move || consumer.consume(&event))
                    .await
                    .unwrap_or_else(|join| {
                        tracing::error!(panicked = join.is_panic(), "consume task failed");
                        Err(ConsumerError::Panicked)
                    })
            };
            let _ = tx_done.send(DoneMsg {
                event,
                consumer,
                result,
            });
        });
    }

    fn handle_done(&mut self, msg: DoneMsg) {
        match msg.result {
            Ok(Control::Keep) => {}
            Ok(Control::Reload) => {
                tracing::debug!("reload triggered");
                self.reload(&msg.consumer);
            }
            Err(e) => {
                tracing::error!(file = %msg.event.path.display(), error = %e, "consumer failed")
            }
        }
        if msg.event.kind.is_delete() {
            self.remove_inode(msg.event.inode);
        }
    }

    /// Arm a watch for `path`, parking it in a missing-file poller when
    /// the path does not exist yet.
    fn add_watch(&mut self, path: PathBuf, consumer: Arc<dyn Consumer>) {
        match self.fim.add(&path) {
            Ok(()) => {
                tracing::debug!(file = %path.display(), "start watching");
                self.dispatch.insert(path, consumer);
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(file = %path.display(), "file does not exist, polling filesystem");
                let missing =
                    MissingFileWatcher::spawn(path.clone(), consumer, self.tx_events.clone());
                self.dispatch.insert(path, missing);
            }
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "failed to add to watch list")
            }
        }
    }

    /// A new object appeared under a watched directory: build a generic
    /// consumer for it and arm the watch. `event.path` holds the new
    /// basename and is rewritten to the full path.
    fn add_inode(&mut self, event: &mut Event, is_dir: bool) {
        let Some(parent) = self.fim.lookup(event.inode) else {
            tracing::debug!(inode = event.inode, "no watched parent for inode");
            return;
        };
        let full = parent.join(&event.path);
        event.path = full.clone();
        let state = GenericState::new(full.clone(), is_dir, self.key);
        let consumer: Arc<dyn Consumer> = Arc::new(BaseConsumer::new(
            self.db.clone(),
            self.notifier.clone(),
            state,
        ));
        self.consumers.push(consumer.clone());
        self.add_watch(full, consumer);
    }

    /// A parked path appeared: re-run its registration so the real
    /// consumer's paths get armed in the kernel.
    fn promote_missing(&mut self, path: &Path) {
        let Some(consumer) = self.dispatch.remove(path) else {
            return;
        };
        for p in consumer.register() {
            if self.excludes.matches(&p) {
                continue;
            }
            self.add_watch(p, consumer.clone());
        }
    }

    /// Untangle a rename. The source identity is in `event.device`, the
    /// target directory in `event.new_inode` and, when the target
    /// already existed, its old inode in `event.new_device`.
    fn handle_rename(&mut self, event: &mut Event) -> Result<()> {
        if let Some(source) = self.fim.lookup(event.device) {
            self.dispatch.remove(&source);
            self.fim.forget_path(&source);
        }

        if event.new_device == 0 {
            // Renamed onto a path nobody watched: treat as a creation in
            // the target directory.
            let Some(_target_dir) = self.fim.lookup(event.new_inode) else {
                bail!("can't find record for inode {}", event.new_inode);
            };
            event.inode = event.new_inode;
            self.add_inode(event, false);
        } else {
            // Renamed over an existing watched file: keep its consumer,
            // point the watch at the new inode.
            let Some(target) = self.fim.lookup(event.new_device) else {
                bail!("can't find record for inode {}", event.new_device);
            };
            self.fim.forget_inode(event.new_device);
            if let Err(e) = self.fim.add(&target) {
                tracing::error!(file = %target.display(), error = %e,
                    "can't update monitoring for renamed file");
            }
            event.path = target;
        }

        // Downstream lookups key off the source identity.
        event.inode = event.device;
        Ok(())
    }

    /// Reconcile a consumer's registrations with what its `register()`
    /// returns now.
    fn reload(&mut self, consumer: &Arc<dyn Consumer>) {
        let wanted: Vec<PathBuf> = consumer
            .register()
            .into_iter()
            .filter(|p| !self.excludes.matches(p))
            .collect();
        let current: Vec<PathBuf> = self
            .dispatch
            .iter()
            .filter(|(_, c)| Arc::ptr_eq(c, consumer))
            .map(|(p, _)| p.clone())
            .collect();
        for stale in current.iter().filter(|p| !wanted.contains(p)) {
            tracing::debug!(file = %stale.display(), "unregistering");
            if let Err(e) = self.fim.remove(stale) {
                tracing::error!(file = %stale.display(), error = %e, "failed to remove watch");
            }
            self.dispatch.remove(stale);
        }
        for fresh in wanted.into_iter().filter(|p| !current.contains(p)) {
            tracing::debug!(file = %fresh.display(), "registering");
            self.add_watch(fresh, consumer.clone());
        }
    }

    /// Drop a deleted object from the kernel map, the dispatch map and
    /// the consumer list.
    fn remove_inode(&mut self, inode: u64) {
        match self.fim.remove_by_inode(inode) {
            Ok(path) => {
                if let Some(consumer) = self.dispatch.remove(&path) {
                    self.consumers.retain(|c| !Arc::ptr_eq(c, &consumer));
                }
            }
            Err(e) => tracing::error!(inode, error = %e, "failed to remove watch"),
        }
    }
}

/// Resolve the consumer covering `path` by walking up parent
/// directories; directory consumers cover their descendants.
fn lookup_consumer(
    dispatch: &HashMap<PathBuf, Arc<dyn Consumer>>,
    path: &Path,
) -> Option<Arc<dyn Consumer>> {
    let mut current = path;
    loop {
        if let Some(consumer) = dispatch.get(current) {
            return Some(consumer.clone());
        }
        current = current.parent()?;
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::MetadataExt, time::Duration};

    use parking_lot::{Mutex, RwLock};
    use vigil_bpf::{FimError, Mirror};

    use super::*;
    use crate::notify::capture;

    const TEST_KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    /// Mirror-only watch-set: same bookkeeping as the real FIM, minus
    /// the kernel map pushes.
    #[derive(Clone, Default)]
    struct MirrorOnly {
        mirror: Arc<RwLock<Mirror>>,
    }

    impl WatchSet for MirrorOnly {
        fn add(&self, path: &Path) -> Result<(), FimError> {
            let meta = fs::metadata(path).map_err(|source| FimError::Stat {
                path: path.to_path_buf(),
                source,
            })?;
            self.mirror.write().insert(meta.ino(), path.to_path_buf());
            Ok(())
        }

        fn remove(&self, path: &Path) -> Result<(), FimError> {
            self.mirror
                .write()
                .remove_path(path)
                .map(|_| ())
                .ok_or_else(|| FimError::NotWatched(path.to_path_buf()))
        }

        fn remove_by_inode(&self, inode: u64) -> Result<PathBuf, FimError> {
            self.mirror
                .write()
                .remove_inode(inode)
                .ok_or(FimError::UnknownInode(inode))
        }

        fn lookup(&self, inode: u64) -> Option<PathBuf> {
            self.mirror.read().path_of(inode)
        }

        fn alias(&self, inode: u64, path: PathBuf) {
            self.mirror.write().insert(inode, path);
        }

        fn forget_path(&self, path: &Path) {
            self.mirror.write().remove_path(path);
        }

        fn forget_inode(&self, inode: u64) {
            self.mirror.write().remove_inode(inode);
        }

        fn watched_count(&self) -> usize {
            self.mirror.read().len()
        }

        fn shutdown(&mut self) {}
    }

    struct Stub;

    impl Consumer for Stub {
        fn init(&self) -> Result<Control, ConsumerError> {
            Ok(Control::Keep)
        }

        fn consume(&self, _event: &Event) -> Result<Control, ConsumerError> {
            Ok(Control::Keep)
        }

        fn register(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    fn stub() -> Arc<dyn Consumer> {
        Arc::new(Stub)
    }

    /// Consumer whose registration set can be swapped between calls.
    struct Rereg {
        paths: Mutex<Vec<PathBuf>>,
    }

    impl Consumer for Rereg {
        fn init(&self) -> Result<Control, ConsumerError> {
            Ok(Control::Keep)
        }

        fn consume(&self, _event: &Event) -> Result<Control, ConsumerError> {
            Ok(Control::Keep)
        }

        fn register(&self) -> Vec<PathBuf> {
            self.paths.lock().clone()
        }
    }

    fn harness(
        dir: &tempfile::TempDir,
    ) -> (MirrorOnly, Arc<StateDb>, Arc<Notifier>, capture::Buffer) {
        let db = Arc::new(StateDb::open(&dir.path().join("state.db")).unwrap());
        let (notifier, buffer) = capture::notifier();
        (MirrorOnly::default(), db, notifier, buffer)
    }

    fn watcher_with(
        fim: MirrorOnly,
        db: Arc<StateDb>,
        notifier: Arc<Notifier>,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> (Watcher<MirrorOnly>, ShutdownHandle, mpsc::Sender<Event>) {
        let (tx_events, rx_events) = mpsc::channel(10);
        let (watcher, shutdown) = Watcher::new(
            fim,
            rx_events,
            tx_events.clone(),
            db,
            notifier,
            TEST_KEY,
            consumers,
            ExcludeList::default(),
        );
        (watcher, shutdown, tx_events)
    }

    fn generic_consumer(
        db: &Arc<StateDb>,
        notifier: &Arc<Notifier>,
        path: PathBuf,
        is_dir: bool,
    ) -> Arc<dyn Consumer> {
        Arc::new(BaseConsumer::new(
            db.clone(),
            notifier.clone(),
            GenericState::new(path, is_dir, TEST_KEY),
        ))
    }

    fn ino(path: &Path) -> u64 {
        fs::metadata(path).unwrap().ino()
    }

    fn kernel_event(
        kind: EventKind,
        inode: u64,
        device: u64,
        new_inode: u64,
        new_device: u64,
        name: &str,
    ) -> Event {
        Event {
            kind,
            pid: 1,
            uid: 0,
            size: 0,
            inode,
            device,
            new_inode,
            new_device,
            command: "mv".to_string(),
            path: PathBuf::from(name),
        }
    }

    async fn wait_for_records(buffer: &capture::Buffer, count: usize) {
        for _ in 0..200 {
            if buffer.records().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} notification records");
    }

    #[test]
    fn lookup_walks_up_to_directory_consumers() {
        let dir = stub();
        let file = stub();
        let mut dispatch: HashMap<PathBuf, Arc<dyn Consumer>> = HashMap::new();
        dispatch.insert(PathBuf::from("/watched"), dir.clone());
        dispatch.insert(PathBuf::from("/watched/a.txt"), file.clone());

        let hit = lookup_consumer(&dispatch, Path::new("/watched/a.txt")).unwrap();
        assert!(Arc::ptr_eq(&hit, &file));

        let hit = lookup_consumer(&dispatch, Path::new("/watched/sub/deep/b.txt")).unwrap();
        assert!(Arc::ptr_eq(&hit, &dir));

        assert!(lookup_consumer(&dispatch, Path::new("/elsewhere/c.txt")).is_none());
    }

    #[test]
    fn lookup_of_bare_basename_misses() {
        let dispatch: HashMap<PathBuf, Arc<dyn Consumer>> = HashMap::new();
        assert!(lookup_consumer(&dispatch, Path::new("orphan.txt")).is_none());
    }

    #[test]
    fn creation_under_watched_directory_gets_its_own_consumer() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir(&watched).unwrap();
        let a = watched.join("a.txt");
        fs::write(&a, b"bytes").unwrap();

        let (fim, db, notifier, _buffer) = harness(&tmp);
        let dir_consumer = generic_consumer(&db, &notifier, watched.clone(), true);
        let (mut watcher, _shutdown, _tx) =
            watcher_with(fim.clone(), db, notifier, vec![dir_consumer.clone()]);
        watcher.register_all();

        let mut create = kernel_event(EventKind::FileCreate, ino(&watched), ino(&a), 0, 0, "a.txt");
        watcher.add_inode(&mut create, false);

        assert_eq!(create.path, a);
        assert_eq!(fim.mirror.read().inode_of(&a), Some(ino(&a)));
        let under_a = watcher.dispatch.get(&a).cloned().unwrap();
        assert!(!Arc::ptr_eq(&under_a, &dir_consumer));
    }

    #[test]
    fn rename_to_new_path_rebinds_mirror_and_makes_a_fresh_consumer() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir(&watched).unwrap();
        let a = watched.join("a.txt");
        fs::write(&a, b"bytes").unwrap();

        let (fim, db, notifier, _buffer) = harness(&tmp);
        let dir_consumer = generic_consumer(&db, &notifier, watched.clone(), true);
        let (mut watcher, _shutdown, _tx) =
            watcher_with(fim.clone(), db, notifier, vec![dir_consumer]);
        watcher.register_all();

        let a_ino = ino(&a);
        let mut create = kernel_event(EventKind::FileCreate, ino(&watched), a_ino, 0, 0, "a.txt");
        watcher.add_inode(&mut create, false);
        let old_consumer = watcher.dispatch.get(&a).cloned().unwrap();

        let b = watched.join("b.txt");
        fs::rename(&a, &b).unwrap();
        let mut rename =
            kernel_event(EventKind::Rename, ino(&watched), a_ino, ino(&watched), 0, "b.txt");
        watcher.handle_rename(&mut rename).unwrap();

        // The mirror holds dst under the source inode, src is gone.
        assert_eq!(fim.mirror.read().path_of(a_ino), Some(b.clone()));
        assert_eq!(fim.mirror.read().inode_of(&a), None);
        assert_eq!(rename.path, b);
        assert_eq!(rename.inode, a_ino);

        // dst did not exist before the rename: a fresh consumer covers it.
        assert!(watcher.dispatch.get(&a).is_none());
        let under_b = watcher.dispatch.get(&b).cloned().unwrap();
        assert!(!Arc::ptr_eq(&under_b, &old_consumer));
    }

    #[test]
    fn rename_over_existing_path_keeps_its_consumer() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir(&watched).unwrap();
        let a = watched.join("a.txt");
        let b = watched.join("b.txt");
        fs::write(&a, b"source").unwrap();
        fs::write(&b, b"target").unwrap();

        let (fim, db, notifier, _buffer) = harness(&tmp);
        let consumer_a = generic_consumer(&db, &notifier, a.clone(), false);
        let consumer_b = generic_consumer(&db, &notifier, b.clone(), false);
        let (mut watcher, _shutdown, _tx) = watcher_with(
            fim.clone(),
            db,
            notifier,
            vec![consumer_a, consumer_b.clone()],
        );
        watcher.register_all();

        let a_ino = ino(&a);
        let b_old_ino = ino(&b);
        fs::rename(&a, &b).unwrap();
        let mut rename =
            kernel_event(EventKind::Rename, ino(&watched), a_ino, ino(&watched), b_old_ino, "b.txt");
        watcher.handle_rename(&mut rename).unwrap();

        assert_eq!(fim.mirror.read().path_of(a_ino), Some(b.clone()));
        assert_eq!(fim.mirror.read().inode_of(&a), None);
        assert_eq!(fim.mirror.read().path_of(b_old_ino), None);
        assert_eq!(rename.path, b);
        assert_eq!(rename.inode, a_ino);

        // dst existed before the rename: its consumer is kept.
        assert!(watcher.dispatch.get(&a).is_none());
        let under_b = watcher.dispatch.get(&b).cloned().unwrap();
        assert!(Arc::ptr_eq(&under_b, &consumer_b));
    }

    #[test]
    fn delete_clears_mirror_dispatch_and_consumer_list() {
        let tmp = tempfile::tempdir().unwrap();
        let tracked = tmp.path().join("tracked");
        fs::write(&tracked, b"bytes").unwrap();

        let (fim, db, notifier, _buffer) = harness(&tmp);
        let consumer = generic_consumer(&db, &notifier, tracked.clone(), false);
        let (mut watcher, _shutdown, _tx) =
            watcher_with(fim.clone(), db, notifier, vec![consumer.clone()]);
        watcher.register_all();
        let tracked_ino = ino(&tracked);

        let msg = DoneMsg {
            event: kernel_event(
                EventKind::DeleteFile,
                tracked_ino,
                0,
                0,
                0,
                tracked.to_str().unwrap(),
            ),
            consumer: consumer.clone(),
            result: Ok(Control::Keep),
        };
        watcher.handle_done(msg);

        assert!(watcher.dispatch.get(&tracked).is_none());
        assert_eq!(fim.mirror.read().inode_of(&tracked), None);
        assert_eq!(fim.mirror.read().len(), 0);
        assert!(watcher.consumers.is_empty());
    }

    #[test]
    fn reload_swaps_registrations() {
        let tmp = tempfile::tempdir().unwrap();
        let one = tmp.path().join("one");
        let two = tmp.path().join("two");
        fs::write(&one, b"1").unwrap();
        fs::write(&two, b"2").unwrap();

        let (fim, db, notifier, _buffer) = harness(&tmp);
        let rereg = Arc::new(Rereg {
            paths: Mutex::new(vec![one.clone()]),
        });
        let consumer: Arc<dyn Consumer> = rereg.clone();
        let (mut watcher, _shutdown, _tx) =
            watcher_with(fim.clone(), db, notifier, vec![consumer.clone()]);
        watcher.register_all();
        assert!(watcher.dispatch.contains_key(&one));

        *rereg.paths.lock() = vec![two.clone()];
        watcher.reload(&consumer);

        assert!(watcher.dispatch.get(&one).is_none());
        assert_eq!(fim.mirror.read().inode_of(&one), None);
        let under_two = watcher.dispatch.get(&two).cloned().unwrap();
        assert!(Arc::ptr_eq(&under_two, &consumer));
        assert_eq!(fim.mirror.read().inode_of(&two), Some(ino(&two)));
    }

    #[tokio::test]
    async fn renamed_file_reports_modified_under_its_new_path() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir(&watched).unwrap();
        let a = watched.join("a.txt");
        fs::write(&a, b"bytes").unwrap();

        let (fim, db, notifier, buffer) = harness(&tmp);
        let dir_consumer = generic_consumer(&db, &notifier, watched.clone(), true);
        let (watcher, shutdown, tx) = watcher_with(fim.clone(), db, notifier, vec![dir_consumer]);
        let task = tokio::spawn(watcher.run());

        let watched_ino = ino(&watched);
        let a_ino = ino(&a);
        tx.send(kernel_event(EventKind::FileCreate, watched_ino, a_ino, 0, 0, "a.txt"))
            .await
            .unwrap();
        wait_for_records(&buffer, 1).await;

        let b = watched.join("b.txt");
        fs::rename(&a, &b).unwrap();
        tx.send(kernel_event(EventKind::Rename, watched_ino, a_ino, watched_ino, 0, "b.txt"))
            .await
            .unwrap();
        wait_for_records(&buffer, 2).await;

        fs::write(&b, b"new bytes").unwrap();
        // Modify records reach the loop with the path already resolved
        // through the mirror, the way the decoder emits them.
        let mut modify = kernel_event(EventKind::Modify, a_ino, 0, 0, 0, "");
        modify.path = fim.mirror.read().path_of(a_ino).unwrap();
        tx.send(modify).await.unwrap();
        wait_for_records(&buffer, 3).await;

        shutdown.stop();
        task.await.unwrap().unwrap();

        let records = buffer.records();
        assert_eq!(records[0]["message"], "generic file created");
        assert_eq!(records[0]["file"], a.display().to_string());
        assert_eq!(records[2]["message"], "generic file Modified");
        assert_eq!(records[2]["file"], b.display().to_string());
        assert_eq!(fim.mirror.read().path_of(a_ino), Some(b));
        assert_eq!(fim.mirror.read().inode_of(&a), None);
    }
}

//! The FIM kernel event source: object loading, kprobe attachment,
//! rules-map bookkeeping and the perf-ring → [`Event`] pipeline.

use std::{
    fs,
    mem,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use aya::{
    maps::{perf::AsyncPerfEventArray, HashMap as AyaHashMap, MapData},
    programs::KProbe,
    util::online_cpus,
    Bpf, BpfLoader,
};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::{
    bpf_fs,
    events::{Event, EventKind, RawEvent},
    mirror::Mirror,
    procfs, FimError, CHANNEL_CAPACITY,
};

const RULES_MAP: &str = "rules";
const EVENTS_MAP: &str = "events";

/// Kernel functions the object hooks, by program symbol.
const ATTACH_POINTS: [(&str, &str); 6] = [
    ("trace_write_entry", "vfs_write"),
    ("trace_vfs_rename", "vfs_rename"),
    ("trace_vfs_unlink", "vfs_unlink"),
    ("trace_vfs_rmdir", "vfs_rmdir"),
    ("trace_done_path_create", "done_path_create"),
    ("trace_do_dentry_open", "do_dentry_open"),
];

/// Perf pages per CPU (4 KiB each), must be a power of two.
const PERF_PAGES: usize = 64;

/// How long the decoder lets the kernel's own map bookkeeping settle
/// after a directory creation before publishing the event. `mkdir -p`
/// bursts arrive out of order without this.
const DIR_CREATE_SETTLE: Duration = Duration::from_millis(50);
const DIR_CREATE_RETRY: Duration = Duration::from_millis(10);

/// The watch-set operations the dispatch loop drives.
///
/// [`Fim`] implements this against the kernel rules map plus the
/// userspace mirror. The dispatch logic is written against the trait so
/// it can be exercised with a mirror-only implementation, no loaded
/// program required.
pub trait WatchSet: Send {
    /// Start watching `path`.
    fn add(&self, path: &Path) -> Result<(), FimError>;
    /// Stop watching `path`.
    fn remove(&self, path: &Path) -> Result<(), FimError>;
    /// Stop watching whatever `inode` currently names; returns its path.
    fn remove_by_inode(&self, inode: u64) -> Result<PathBuf, FimError>;
    /// The path `inode` currently names, if watched.
    fn lookup(&self, inode: u64) -> Option<PathBuf>;
    /// Record `inode → path` in the mirror without touching the kernel
    /// map. Used while untangling renames, where the kernel rule is
    /// refreshed separately through [`WatchSet::add`].
    fn alias(&self, inode: u64, path: PathBuf);
    /// Drop a mirror entry by path, leaving the kernel map alone.
    fn forget_path(&self, path: &Path);
    /// Drop a mirror entry by inode, leaving the kernel map alone.
    fn forget_inode(&self, inode: u64);
    fn watched_count(&self) -> usize;
    /// Release kernel resources on the way out.
    fn shutdown(&mut self);
}

struct Shared {
    rules: Mutex<AyaHashMap<MapData, u64, u64>>,
    mirror: RwLock<Mirror>,
}

/// Handle to the loaded eBPF program and its watch-set.
///
/// All watch-set mutation goes through its [`WatchSet`] methods so the
/// kernel map and the userspace mirror never drift apart.
pub struct Fim {
    shared: Arc<Shared>,
    tx_exit: watch::Sender<()>,
    // Keeps programs attached for the lifetime of the handle.
    _bpf: Bpf,
}

impl Fim {
    /// Load the eBPF object from `object_path`, attach the VFS kprobes
    /// and start the perf readers. Decoded events are delivered on `tx`.
    pub async fn load(object_path: &Path, tx: mpsc::Sender<Event>) -> Result<Fim, FimError> {
        bpf_fs::remove_stale_rules_pin();

        let data = fs::read(object_path).map_err(|source| FimError::ReadObject {
            path: object_path.to_path_buf(),
            source,
        })?;
        let mut bpf = tokio::task::spawn_blocking(move || -> Result<Bpf, FimError> {
            if let Err(e) = bpf_fs::ensure_pin_dir() {
                tracing::warn!(error = %e, "cannot create bpf pin directory");
            }
            let mut bpf = BpfLoader::new().map_pin_path(bpf_fs::PIN_DIR).load(&data)?;
            for (symbol, function) in ATTACH_POINTS {
                attach_kprobe(&mut bpf, symbol, function)?;
            }
            Ok(bpf)
        })
        .await
        .expect("join error")?;

        let rules = AyaHashMap::try_from(
            bpf.take_map(RULES_MAP)
                .ok_or_else(|| FimError::MapNotFound(RULES_MAP.to_string()))?,
        )?;
        let mut perf = AsyncPerfEventArray::try_from(
            bpf.take_map(EVENTS_MAP)
                .ok_or_else(|| FimError::MapNotFound(EVENTS_MAP.to_string()))?,
        )?;

        let shared = Arc::new(Shared {
            rules: Mutex::new(rules),
            mirror: RwLock::new(Mirror::default()),
        });
        let (tx_exit, _) = watch::channel(());
        let (tx_raw, rx_raw) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        for cpu_id in online_cpus().map_err(FimError::OnlineCpus)? {
            let mut buf = perf.open(cpu_id, Some(PERF_PAGES))?;
            let tx_raw = tx_raw.clone();
            let mut rx_exit = tx_exit.subscribe();
            tokio::spawn(async move {
                let buffer_size = RawEvent::SIZE + mem::size_of::<u32>();
                let mut buffers = (0..CHANNEL_CAPACITY)
                    .map(|_| BytesMut::with_capacity(buffer_size))
                    .collect::<Vec<_>>();
                loop {
                    let events = tokio::select! {
                        _ = rx_exit.changed() => return,
                        events = buf.read_events(&mut buffers) => events,
                    };
                    match events {
                        Ok(events) => {
                            if events.lost > 0 {
                                tracing::warn!(cpu = cpu_id, lost = events.lost, "perf ring overrun");
                            }
                            for buffer in buffers.iter_mut().take(events.read) {
                                let record = mem::replace(
                                    buffer,
                                    BytesMut::with_capacity(buffer_size),
                                )
                                .freeze();
                                if tx_raw.send(record).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(cpu = cpu_id, error = %e, "perf read failed");
                            return;
                        }
                    }
                }
            });
        }

        tokio::spawn(decode_loop(
            shared.clone(),
            rx_raw,
            tx,
            tx_exit.subscribe(),
        ));

        Ok(Fim {
            shared,
            tx_exit,
            _bpf: bpf,
        })
    }
}

impl WatchSet for Fim {
    /// Resolve `path` to `(inode, device)`, push the rule to the kernel
    /// and record the mirror entry.
    fn add(&self, path: &Path) -> Result<(), FimError> {
        let meta = fs::metadata(path).map_err(|source| FimError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        let (inode, device) = (meta.ino(), meta.dev());
        tracing::debug!(file = %path.display(), inode, "pushing rule to kernel");
        self.shared.rules.lock().insert(inode, device, 0)?;
        self.shared.mirror.write().insert(inode, path.to_path_buf());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), FimError> {
        let inode = self
            .shared
            .mirror
            .write()
            .remove_path(path)
            .ok_or_else(|| FimError::NotWatched(path.to_path_buf()))?;
        self.shared.rules.lock().remove(&inode)?;
        tracing::debug!(file = %path.display(), inode, "rule removed");
        Ok(())
    }

    fn remove_by_inode(&self, inode: u64) -> Result<PathBuf, FimError> {
        let path = self
            .shared
            .mirror
            .write()
            .remove_inode(inode)
            .ok_or(FimError::UnknownInode(inode))?;
        self.shared.rules.lock().remove(&inode)?;
        tracing::debug!(file = %path.display(), inode, "rule removed");
        Ok(path)
    }

    fn lookup(&self, inode: u64) -> Option<PathBuf> {
        self.shared.mirror.read().path_of(inode)
    }

    fn alias(&self, inode: u64, path: PathBuf) {
        self.shared.mirror.write().insert(inode, path);
    }

    fn forget_path(&self, path: &Path) {
        self.shared.mirror.write().remove_path(path);
    }

    fn forget_inode(&self, inode: u64) {
        self.shared.mirror.write().remove_inode(inode);
    }

    fn watched_count(&self) -> usize {
        self.shared.mirror.read().len()
    }

    /// Stop the perf readers and clear every watched inode out of the
    /// kernel map.
    fn shutdown(&mut self) {
        let _ = self.tx_exit.send(());
        tracing::debug!("polling stopped");
        let mut rules = self.shared.rules.lock();
        for inode in self.shared.mirror.read().inodes() {
            if let Err(e) = rules.remove(&inode) {
                tracing::error!(inode, error = %e, "error removing rule");
            }
        }
        tracing::debug!("kernel rules cleared");
    }
}

fn attach_kprobe(bpf: &mut Bpf, symbol: &str, function: &str) -> Result<(), FimError> {
    let program: &mut KProbe = bpf
        .program_mut(symbol)
        .ok_or_else(|| FimError::ProgramNotFound(symbol.to_string()))?
        .try_into()
        .map_err(|_| FimError::ProgramType(symbol.to_string()))?;
    program.load().map_err(|e| FimError::ProgramLoad {
        program: symbol.to_string(),
        source: Box::new(e),
    })?;
    program.attach(function, 0).map_err(|e| FimError::ProgramAttach {
        program: symbol.to_string(),
        source: Box::new(e),
    })?;
    tracing::debug!(kprobe = function, program = symbol, "attached");
    Ok(())
}

/// Turn raw perf records into [`Event`]s: decode, resolve the command
/// line and the path, drop configuration-management churn, and publish.
async fn decode_loop(
    shared: Arc<Shared>,
    mut rx_raw: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Event>,
    mut rx_exit: watch::Receiver<()>,
) {
    loop {
        let record = tokio::select! {
            _ = rx_exit.changed() => return,
            record = rx_raw.recv() => match record {
                Some(record) => record,
                None => return,
            },
        };
        let Some(raw) = RawEvent::read(&record) else {
            tracing::error!(len = record.len(), "undersized perf record, skipping");
            continue;
        };
        let Some(kind) = EventKind::from_raw(raw.mode) else {
            tracing::error!(mode = raw.mode, "unknown event mode, skipping");
            continue;
        };

        let comm = raw.comm();
        if comm.starts_with("puppet") {
            tracing::debug!("skipping event generated by puppet");
            continue;
        }
        let command = procfs::command_line(raw.pid).unwrap_or(comm);

        if kind == EventKind::DirCreate {
            tokio::time::sleep(DIR_CREATE_SETTLE).await;
            if !shared.mirror.read().contains_inode(raw.inode) {
                tokio::time::sleep(DIR_CREATE_RETRY).await;
            }
        }

        let path = if kind.carries_name() {
            PathBuf::from(raw.name())
        } else {
            match shared.mirror.read().path_of(raw.inode) {
                Some(path) => path,
                None => {
                    tracing::error!(inode = raw.inode, "inode not in mirror, dropping rule");
                    if let Err(e) = shared.rules.lock().remove(&raw.inode) {
                        tracing::error!(inode = raw.inode, error = %e, "rule cleanup failed");
                    }
                    continue;
                }
            }
        };

        let event = Event {
            kind,
            pid: raw.pid,
            uid: raw.uid,
            size: raw.size,
            inode: raw.inode,
            device: raw.device,
            new_inode: raw.new_inode,
            new_device: raw.new_device,
            command,
            path,
        };
        tracing::debug!(?event, "event from kernel");
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

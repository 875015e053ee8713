//! vigil is a host-resident file integrity monitor powered by eBPF.
//!
//! Kprobes on the VFS entry points surface writes, renames, creations
//! and deletions for an explicitly configured watch-set, filtered in the
//! kernel by inode. Every event re-parses the affected file, diffs its
//! logical state against the state persisted in an embedded database and
//! emits one structured log record describing what was added, removed or
//! modified, together with the initiating process and user.
//!
//! Four file categories are tracked:
//!
//! - the account database (`passwd` + `shadow` + discovered
//!   `authorized_keys` files), diffed per user
//! - the `access.conf` grant/deny list
//! - critical files, diffed line by line
//! - everything else, tracked by an encrypted content hash

use std::{collections::HashSet, fs, path::PathBuf, sync::Arc};

use anyhow::{ensure, Context, Result};
use rand::{rngs::OsRng, RngCore};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tracing_subscriber::EnvFilter;
use vigil_bpf::{Fim, CHANNEL_CAPACITY};
use vigil_parsers::digest::KEY_LEN;
use vigil_store::StateDb;

pub mod cli;
pub mod config;
mod consumers;
mod missing;
mod notify;
mod paths;
mod watcher;

use cli::Options;
use config::Config;
use consumers::{
    AccessState, BaseConsumer, Consumer, CriticalState, GenericState, UsersState,
};
use notify::Notifier;
use paths::ExcludeList;
use watcher::Watcher;

/// Log from the configured level, as newline-delimited JSON on stderr.
/// `RUST_LOG` takes precedence when set.
pub fn init_logger(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run the agent until SIGINT/SIGTERM or a fatal error.
pub async fn run(options: Options) -> Result<()> {
    let mut config = Config::load(&options.config)?;
    if let Some(level) = options.level {
        config.level = level;
    }
    if let Some(database) = options.database {
        config.database = database;
    }
    if let Some(bpf_object) = options.bpf_object {
        config.bpf_object = bpf_object;
    }
    init_logger(&config.level);
    tracing::debug!(?config, "configuration loaded");

    let key = load_key(config.keyfile.as_deref())?;
    let db = Arc::new(StateDb::open(&config.database).context("opening state database")?);
    let notifier = Arc::new(Notifier::stderr());

    let (tx_events, rx_events) = mpsc::channel(CHANNEL_CAPACITY);
    let fim = Fim::load(&config.bpf_object, tx_events.clone())
        .await
        .context("starting ebpf")?;

    let consumers = build_consumers(&config, &db, &notifier, &key);
    for consumer in &consumers {
        if let Err(e) = consumer.init() {
            tracing::error!(error = %e, "failed to init consumer");
        }
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        consumers = consumers.len(),
        "vigil initialized"
    );

    let excludes = ExcludeList::compile(&config.consumers.excludes);
    let (watcher, shutdown) = Watcher::new(
        fim,
        rx_events,
        tx_events,
        db,
        notifier,
        key,
        consumers,
        excludes,
    );
    let mut task = tokio::spawn(watcher.run());

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = &mut task => return result.expect("watcher task died"),
        _ = sig_int.recv() => tracing::info!("received a sigint"),
        _ = sig_term.recv() => tracing::info!("received a sigterm"),
    }
    shutdown.stop();
    task.await.expect("watcher task died")?;
    tracing::debug!("graceful shutdown complete");
    Ok(())
}

/// The digest key: 16 bytes from the configured keyfile, or a fresh
/// random key for the lifetime of this process. Without a keyfile,
/// generic digests do not survive restarts and every generic file is
/// reported once at first boot.
fn load_key(keyfile: Option<&std::path::Path>) -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    match keyfile {
        None => OsRng.fill_bytes(&mut key),
        Some(path) => {
            let data = fs::read(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            ensure!(
                data.len() >= KEY_LEN,
                "key file {} holds fewer than {KEY_LEN} bytes",
                path.display()
            );
            key.copy_from_slice(&data[..KEY_LEN]);
        }
    }
    Ok(key)
}

/// Build the consumer set from configuration, mirroring the precedence
/// of the config sections: access, then users, then critical files, then
/// the generic walkers. A path claimed by an earlier, more specific
/// consumer is not registered again.
fn build_consumers(
    config: &Config,
    db: &Arc<StateDb>,
    notifier: &Arc<Notifier>,
    key: &[u8; KEY_LEN],
) -> Vec<Arc<dyn Consumer>> {
    let excludes = ExcludeList::compile(&config.consumers.excludes);
    let root = config.consumers.root.as_deref();
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    let mut consumers: Vec<Arc<dyn Consumer>> = Vec::new();

    if let Some(access) = &config.consumers.access {
        let real = paths::rebase(root, access);
        if !excludes.matches(&real) {
            claimed.insert(real.clone());
            consumers.push(Arc::new(BaseConsumer::new(
                db.clone(),
                notifier.clone(),
                AccessState::new(real),
            )));
        }
    }

    if let (Some(passwd), Some(shadow)) = (&config.consumers.passwd, &config.consumers.shadow) {
        let passwd = paths::rebase(root, passwd);
        let shadow = paths::rebase(root, shadow);
        if !excludes.matches(&passwd) || !excludes.matches(&shadow) {
            claimed.insert(passwd.clone());
            claimed.insert(shadow.clone());
            consumers.push(Arc::new(BaseConsumer::new(
                db.clone(),
                notifier.clone(),
                UsersState::new(passwd, shadow, root.map(PathBuf::from)),
            )));
        }
    }

    for info in paths::list_files(&config.consumers.generic_diff, root) {
        if info.is_dir || excludes.matches(&info.path) || !claimed.insert(info.path.clone()) {
            continue;
        }
        consumers.push(Arc::new(BaseConsumer::new(
            db.clone(),
            notifier.clone(),
            CriticalState::new(info.path),
        )));
    }

    for info in paths::list_files(&config.consumers.generic, root) {
        if excludes.matches(&info.path) || !claimed.insert(info.path.clone()) {
            continue;
        }
        consumers.push(Arc::new(BaseConsumer::new(
            db.clone(),
            notifier.clone(),
            GenericState::new(info.path, info.is_dir, *key),
        )));
    }

    consumers
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn random_key_when_no_keyfile() {
        let a = load_key(None).unwrap();
        let b = load_key(None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn keyfile_is_truncated_to_key_len() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"0123456789abcdefEXTRA").unwrap();
        let key = load_key(Some(f.path())).unwrap();
        assert_eq!(&key, b"0123456789abcdef");
    }

    #[test]
    fn short_keyfile_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"short").unwrap();
        assert!(load_key(Some(f.path())).is_err());
    }

    #[test]
    fn consumer_set_follows_configuration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("access.conf"), "+:root:\n").unwrap();
        std::fs::write(dir.path().join("passwd"), "root:x:0:0::/root:/bin/bash\n").unwrap();
        std::fs::write(dir.path().join("shadow"), "root:pw:1::::::\n").unwrap();
        std::fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();
        std::fs::write(dir.path().join("sudoers"), "root ALL=(ALL) ALL\n").unwrap();

        let config = Config {
            consumers: crate::config::ConsumerPaths {
                root: None,
                access: Some(dir.path().join("access.conf")),
                passwd: Some(dir.path().join("passwd")),
                shadow: Some(dir.path().join("shadow")),
                generic: vec![dir.path().join("hosts").to_string_lossy().into_owned()],
                generic_diff: vec![dir.path().join("sudoers").to_string_lossy().into_owned()],
                excludes: Vec::new(),
            },
            ..Config::default()
        };
        let db = Arc::new(StateDb::open(&dir.path().join("state.db")).unwrap());
        let (notifier, _) = crate::notify::capture::notifier();
        let consumers = build_consumers(&config, &db, &notifier, &[1u8; KEY_LEN]);
        // access + users + critical + generic
        assert_eq!(consumers.len(), 4);
    }

    #[test]
    fn claimed_paths_are_not_registered_twice() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("access.conf"), "+:root:\n").unwrap();

        let pattern = dir.path().join("access.conf").to_string_lossy().into_owned();
        let config = Config {
            consumers: crate::config::ConsumerPaths {
                access: Some(dir.path().join("access.conf")),
                // The same file also matches the generic lists.
                generic: vec![pattern.clone()],
                generic_diff: vec![pattern],
                ..Default::default()
            },
            ..Config::default()
        };
        let db = Arc::new(StateDb::open(&dir.path().join("state.db")).unwrap());
        let (notifier, _) = crate::notify::capture::notifier();
        let consumers = build_consumers(&config, &db, &notifier, &[1u8; KEY_LEN]);
        assert_eq!(consumers.len(), 1);
    }
}

//! Kernel event plane.
//!
//! Owns the loaded eBPF object, the kernel-side `rules` hash map listing
//! watched `(inode, device)` pairs, the userspace mirror resolving
//! inodes back to paths, and the perf-ring readers turning raw kernel
//! records into [`Event`]s on a bounded channel.

use std::{io, path::PathBuf};

use aya::maps::perf::PerfBufferError;
use thiserror::Error;

pub mod bpf_fs;
mod events;
mod fim;
mod mirror;
mod procfs;

pub use events::{Event, EventKind, RawEvent};
pub use fim::{Fim, WatchSet};
pub use mirror::Mirror;

/// Capacity of the decoded-event channel and of the raw perf staging
/// channel.
pub const CHANNEL_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum FimError {
    #[error("reading eBPF object {path}")]
    ReadObject {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("loading eBPF object")]
    Load(#[from] aya::BpfError),
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramType(String),
    #[error("failed program load {program}")]
    ProgramLoad {
        program: String,
        #[source]
        source: Box<aya::programs::ProgramError>,
    },
    #[error("failed program attach {program}")]
    ProgramAttach {
        program: String,
        #[source]
        source: Box<aya::programs::ProgramError>,
    },
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
    #[error("perf buffer error")]
    PerfBuffer(#[from] PerfBufferError),
    #[error("listing online cpus")]
    OnlineCpus(#[source] io::Error),
    #[error("stat {path}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("path not watched: {0}")]
    NotWatched(PathBuf),
    #[error("inode not watched: {0}")]
    UnknownInode(u64),
}

impl FimError {
    /// True when adding a watch failed because the file does not exist.
    /// The watcher reacts by polling for the path instead.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FimError::Stat { source, .. }
                if matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                )
        )
    }
}

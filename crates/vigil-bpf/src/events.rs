//! Wire format of the records published by the eBPF program.

use std::{mem, path::PathBuf};

const TASK_COMM_LEN: usize = 16;
const NAME_LEN: usize = 32;

/// Decoded event kind. The numeric tags are owned by the eBPF object;
/// userspace only ever sees the named variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Rename of a watched file or into a watched directory.
    Rename,
    /// Write to an already-watched file.
    Modify,
    /// mkdir inside a watched directory.
    DirCreate,
    /// creat/open(O_CREAT) inside a watched directory.
    FileCreate,
    /// unlink of a watched file.
    DeleteFile,
    /// rmdir of a watched directory.
    DeleteDir,
}

impl EventKind {
    pub fn from_raw(mode: i32) -> Option<Self> {
        match mode {
            0 => Some(EventKind::Rename),
            1 => Some(EventKind::Modify),
            3 => Some(EventKind::DirCreate),
            4 => Some(EventKind::FileCreate),
            -1 => Some(EventKind::DeleteFile),
            -2 => Some(EventKind::DeleteDir),
            _ => None,
        }
    }

    /// Kinds whose record carries the affected basename instead of an
    /// inode already present in the mirror.
    pub fn carries_name(&self) -> bool {
        matches!(
            self,
            EventKind::Rename | EventKind::DirCreate | EventKind::FileCreate
        )
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, EventKind::DeleteFile | EventKind::DeleteDir)
    }
}

/// The packed little-endian record published through the perf ring.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawEvent {
    pub mode: i32,
    pub pid: u32,
    pub uid: u32,
    pub size: u32,
    pub inode: u64,
    pub device: u64,
    /// Target directory inode when renaming.
    pub new_inode: u64,
    /// Target file inode when renaming, 0 if the target did not exist.
    pub new_device: u64,
    pub comm: [u8; TASK_COMM_LEN],
    /// NUL-terminated basename, only meaningful for creation and rename.
    pub name: [u8; NAME_LEN],
}

impl RawEvent {
    pub const SIZE: usize = mem::size_of::<RawEvent>();

    /// Decode a perf record. Returns `None` for undersized buffers.
    pub fn read(buf: &[u8]) -> Option<RawEvent> {
        if buf.len() < Self::SIZE {
            return None;
        }
        // The perf buffer has no alignment guarantee for our struct.
        Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const RawEvent) })
    }

    pub fn comm(&self) -> String {
        cstr_lossy(&self.comm)
    }

    pub fn name(&self) -> String {
        cstr_lossy(&self.name)
    }
}

fn cstr_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A decoded kernel event, with the command line resolved and the path
/// filled in from the mirror (or, for creations and renames, the new
/// basename until the watcher resolves it against the parent).
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub pid: u32,
    pub uid: u32,
    pub size: u32,
    pub inode: u64,
    pub device: u64,
    pub new_inode: u64,
    pub new_device: u64,
    pub command: String,
    pub path: PathBuf,
}

impl Event {
    /// Event injected by a missing-file watcher once its path appears.
    /// Carries no kernel identity; the dispatch loop recognizes the zero
    /// inode and promotes the path to a real watch.
    pub fn synthetic_create(path: PathBuf) -> Event {
        Event {
            kind: EventKind::FileCreate,
            pid: 0,
            uid: 0,
            size: 0,
            inode: 0,
            device: 0,
            new_inode: 0,
            new_device: 0,
            command: String::new(),
            path,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.inode == 0 && self.device == 0
    }
}

//! Command-line resolution from procfs.

use std::fs;

/// Read `/proc/<pid>/cmdline`, joining NUL-separated arguments with
/// spaces. Returns `None` when the process is gone or has an empty
/// command line; the caller falls back to the kernel task comm.
pub(crate) fn command_line(pid: u32) -> Option<String> {
    let data = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let line = data
        .split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

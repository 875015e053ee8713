//! BPF filesystem hygiene.
//!
//! The `rules` map is pinned under the BPF filesystem and survives the
//! process. Entries left over from a previous run would both bloat the
//! kernel map and trigger events for files nobody watches anymore, so
//! the stale pin is unlinked before every load and the map recreated
//! from scratch.

use std::{fs, io, path::Path};

pub(crate) const PIN_DIR: &str = "/sys/fs/bpf/vigil/globals";
const RULES_PIN: &str = "/sys/fs/bpf/vigil/globals/rules";

/// Unlink the pinned rules map from a previous run, if any. A failed
/// unlink is reported but not fatal: the agent still works, at the cost
/// of possibly inheriting stale rules.
pub fn remove_stale_rules_pin() {
    match fs::remove_file(RULES_PIN) {
        Ok(()) => tracing::debug!(pin = RULES_PIN, "removed stale rules map"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(
            pin = RULES_PIN,
            error = %e,
            "unable to delete rules map from previous run, unexpected behavior possible"
        ),
    }
}

/// Make sure the pin directory exists so the loader can re-pin maps the
/// object declares as pinned.
pub(crate) fn ensure_pin_dir() -> io::Result<()> {
    fs::create_dir_all(Path::new(PIN_DIR))
}

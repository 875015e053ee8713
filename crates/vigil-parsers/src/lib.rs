//! Pure parsers turning a watched file into its category value.
//!
//! Each file category tracked by vigil has a parser here: `access` for
//! `access.conf` grant/deny lists, `passwd`/`shadow` for the account
//! database, `critical` for line-diffed critical files and `digest` for
//! everything else. Parsers only read files and build values; diffing,
//! persistence and notification live in the consumer layer.

use std::io;

use thiserror::Error;

pub mod access;
pub mod critical;
pub mod digest;
pub mod passwd;
pub mod shadow;
pub mod users;
mod util;

pub use access::AccessEntries;
pub use critical::CriticalRules;
pub use digest::EncryptedDigest;
pub use users::{User, UsersTable};
pub use util::{mask_left, set_equal, symmetric_diff};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("reading {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("sealing digest: {0}")]
    Crypto(String),
}

impl ParseError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        ParseError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// True when the underlying cause is a missing file or a missing
    /// directory component. Consumers treat this as "file deleted", not
    /// as a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            ParseError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ),
            _ => false,
        }
    }
}

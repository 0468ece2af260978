//! Defines the error types used throughout Nitro.
use std::fmt;
use std::io;

/// The primary error enum for all fallible bulk operations in Nitro.
///
/// Writer operations (`put`, `put_unique`, `delete`) report success through
/// their return values and never produce an error object; this enum is
/// surfaced only by the bulk entry points (`visitor`, `apply_ops`,
/// `store_to_disk`, `load_from_disk`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NitroError {
    /// The instance was closed while the operation was in flight. Long-running
    /// bulk operations check for shutdown between chunks and abort with this.
    Shutdown,
    /// An on-disk dump could not be decoded: bad magic, unsupported version,
    /// or a truncated or malformed record.
    Corrupt(String),
    /// An underlying I/O error from the filesystem.
    Io(String),
    /// An error returned by a caller-supplied per-item callback. Bulk
    /// operations abort on the first callback error and return it verbatim.
    Callback(String),
}

impl fmt::Display for NitroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NitroError::Shutdown => write!(f, "Nitro instance is shut down"),
            NitroError::Corrupt(e) => write!(f, "Corrupt dump: {}", e),
            NitroError::Io(e) => write!(f, "I/O error: {}", e),
            NitroError::Callback(e) => write!(f, "Callback error: {}", e),
        }
    }
}

impl std::error::Error for NitroError {}

impl From<io::Error> for NitroError {
    fn from(err: io::Error) -> Self {
        NitroError::Io(err.to_string())
    }
}

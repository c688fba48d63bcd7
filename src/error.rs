//! Errors raised while starting the patcher

use thiserror::Error;

use crate::host::Status;

/// Errors that can abort (or partially abort) patching
#[derive(Debug, Error)]
pub enum Error {
    /// The loader has no module with the target name
    #[error("Module {name} not found ({status})")]
    ModuleNotFound {
        /// Name that was looked up
        name: &'static str,
        /// Status returned by the loader
        status: Status,
    },
    /// The module was found, but it is not the supported build
    #[error("Unsupported game version (fingerprint {actual:#010X}, expected {expected:#010X})")]
    VersionMismatch {
        /// Fingerprint of the supported build
        expected: u32,
        /// Fingerprint reported by the loader
        actual: u32,
    },
    /// The loader refused to inject one entry of a patch table
    #[error("Failed to apply {table}[{index}] at {offset:#08X} ({status})")]
    Inject {
        /// Name of the patch table
        table: &'static str,
        /// Index of the entry that failed
        index: usize,
        /// Offset of the entry that failed
        offset: u32,
        /// Status returned by the loader
        status: Status,
    },
    /// `start` was called twice on the same plugin
    #[error("Plugin was already started")]
    AlreadyStarted,
    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Loader status attached to this error, if any
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::ModuleNotFound { status, .. } | Error::Inject { status, .. } => Some(*status),
            _ => None,
        }
    }
}

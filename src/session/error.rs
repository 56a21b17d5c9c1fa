//! Session state machine error types and status enums.

use thiserror::Error;

use crate::protocol::SessionId;

// =============================================================================
// MACHINE STATUS
// =============================================================================

/// Run status of a session state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    /// Applying committed entries normally.
    Running,
    /// Stopped after a fatal inconsistency. Only `restore()` clears this.
    Halted,
}

// =============================================================================
// FATAL ERROR
// =============================================================================

/// Errors that halt the session state machine.
///
/// These indicate that this member's view of the log can no longer be
/// trusted. They are never answered to clients; the member must be
/// resynchronized from a snapshot.
#[derive(Debug, Error)]
pub enum SessionFatalError {
    /// A committed entry could not be decoded.
    #[error("corrupt session entry at index {index}: {message}")]
    CorruptEntry { index: u64, message: String },

    /// Entries were delivered out of log order.
    #[error("apply index regression: index {found} after {previous}")]
    IndexRegression { previous: u64, found: u64 },

    /// An entry arrived after a skipped index.
    #[error("apply index gap: expected {expected}, found {found}")]
    LogGap { expected: u64, found: u64 },

    /// A committed entry names a session id that cannot have been assigned yet.
    #[error("entry at index {index} references unassigned {session}")]
    UnassignedSession { index: u64, session: SessionId },

    /// The machine already halted; every apply after the first fatal error
    /// returns this until it is restored.
    #[error("session state machine is halted")]
    Halted,

    /// Snapshot creation or installation failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

// =============================================================================
// SNAPSHOT ERROR
// =============================================================================

/// Errors reading or writing a session snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot too small for header")]
    TooSmall,

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),

    #[error("snapshot header checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderChecksumMismatch { expected: u32, actual: u32 },

    #[error("snapshot state checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    StateChecksumMismatch { expected: u32, actual: u32 },

    #[error("snapshot state size mismatch: expected {expected}, got {actual}")]
    StateSizeMismatch { expected: u64, actual: usize },

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("application snapshot failed: {0}")]
    Application(String),
}

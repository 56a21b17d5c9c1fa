//! Replicated session state.
//!
//! Sessions give clients exactly-once command semantics on top of an
//! at-least-once transport. Each member runs an identical
//! [`SessionStateMachine`] fed by the same committed log:
//! - REGISTER creates a session whose id is the entry's log index
//! - COMMAND is deduplicated by per-session sequence number
//! - KEEP_ALIVE refreshes liveness and acknowledges cached results
//! - EXPIRE (proposed by a timer) ends sessions that went silent
//!
//! Only the apply path mutates session state.

mod entry;
mod error;
mod machine;
mod record;


pub use entry::{EntryKind, ProposalId, SessionEntry};
pub use error::{MachineStatus, SessionFatalError, SnapshotError};
pub use machine::{
    Application, ApplyContext, ApplyReport, SessionOutcome, SessionStateMachine, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};
pub use record::{HeldCommand, Session, SessionState};

//! The replicated session state machine.
//!
//! A single-writer machine driven by the consensus core's apply loop. It owns
//! the session table and the user application, and turns each committed
//! [`SessionEntry`] into zero or more [`SessionOutcome`]s addressed to the
//! proposals waiting on them.
//!
//! # Invariants
//!
//! 1. **Log Order**: `apply` accepts strictly increasing indices only.
//! 2. **Consensus Time**: the apply path never reads a clock. "Now" is the
//!    highest entry timestamp seen so far.
//! 3. **Exactly Once**: a command sequence reaches the application at most
//!    once per session, and only when it is `command_sequence + 1`.
//! 4. **Committed Expiry**: a session becomes `Expired` only by applying an
//!    `Expire` entry whose timestamp still satisfies the timeout.
//! 5. **Halt on Fatal**: after a fatal error no entry is applied until the
//!    machine is restored from a snapshot.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::entry::{EntryKind, ProposalId, SessionEntry};
use super::error::{MachineStatus, SessionFatalError, SnapshotError};
use super::record::{HeldCommand, Session, SessionState};
use crate::config::SessionConfig;
use crate::protocol::{ConnectionId, MemberId, SessionId, Status};

// =============================================================================
// APPLICATION
// =============================================================================

/// Deterministic context handed to the application for each command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyContext {
    index: u64,
    timestamp_ms: u64,
    session: SessionId,
}

impl ApplyContext {
    pub fn new(index: u64, timestamp_ms: u64, session: SessionId) -> Self {
        ApplyContext {
            index,
            timestamp_ms,
            session,
        }
    }

    /// Log index of the entry being applied. A drained held command reports
    /// the index of the entry that released it.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Consensus time, NOT the wall clock.
    #[inline]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }
}

/// The user state machine behind the session layer.
///
/// Commands and queries are opaque bytes. `apply` must be deterministic:
/// the same sequence of calls yields the same results on every member.
pub trait Application: Send + Sync {
    fn apply(&mut self, ctx: &ApplyContext, operation: &[u8]) -> Vec<u8>;

    /// Read-only evaluation. Never changes state.
    fn query(&self, query: &[u8]) -> Vec<u8>;

    fn snapshot(&self) -> Result<Vec<u8>, String>;

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String>;
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of applying an entry, as seen by the proposal that caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Registered { session: SessionId, timeout_ms: u64 },
    KeptAlive,
    Command { sequence: u64, result: Vec<u8> },
    Query { result: Vec<u8> },
    Unregistered,
    /// Outcome of a timer-proposed expiry. `expired` is false for stale ones.
    Expiry { session: SessionId, expired: bool },
    Rejected { status: Status, message: Option<String> },
}

impl SessionOutcome {
    pub fn rejected(status: Status, message: impl Into<String>) -> Self {
        SessionOutcome::Rejected {
            status,
            message: Some(message.into()),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            SessionOutcome::Rejected { status, .. } => *status,
            _ => Status::Ok,
        }
    }
}

/// Everything one committed entry produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: u64,
    pub outcomes: Vec<(ProposalId, SessionOutcome)>,
}

impl ApplyReport {
    fn new(index: u64) -> Self {
        ApplyReport {
            index,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, proposal: ProposalId, outcome: SessionOutcome) {
        self.outcomes.push((proposal, outcome));
    }

    /// Outcome addressed to `proposal`, if any.
    pub fn outcome_for(&self, proposal: ProposalId) -> Option<&SessionOutcome> {
        self.outcomes
            .iter()
            .find(|(p, _)| *p == proposal)
            .map(|(_, outcome)| outcome)
    }
}

// =============================================================================
// SNAPSHOT FORMAT
// =============================================================================

/// Snapshot magic bytes: "SNAP"
pub const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x4E, 0x41, 0x50];

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Snapshot header size in bytes.
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("SNAP")
/// 4       2     version
/// 6       2     flags (zero)
/// 8       8     last_applied
/// 16      8     state_size
/// 24      4     state_checksum (CRC32C)
/// 28      4     header_checksum (CRC32C of bytes 0..28)
/// 32      var   bincode state
/// ```
pub const SNAPSHOT_HEADER_SIZE: usize = 32;

#[derive(Serialize)]
struct SnapshotView<'a> {
    last_applied: u64,
    now_ms: u64,
    sessions: &'a BTreeMap<SessionId, Session>,
    tombstones: &'a BTreeMap<SessionId, SessionState>,
    application: Vec<u8>,
}

#[derive(Deserialize)]
struct SnapshotState {
    last_applied: u64,
    now_ms: u64,
    sessions: BTreeMap<SessionId, Session>,
    tombstones: BTreeMap<SessionId, SessionState>,
    application: Vec<u8>,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Session table plus the application it guards.
pub struct SessionStateMachine<A: Application> {
    config: SessionConfig,
    app: A,
    status: MachineStatus,
    /// Index of the last applied entry; 0 before the first.
    last_applied: u64,
    /// Consensus time: highest entry timestamp applied.
    now_ms: u64,
    sessions: BTreeMap<SessionId, Session>,
    connections: BTreeMap<ConnectionId, SessionId>,
    /// Expired or closed sessions, kept so their clients get
    /// `SessionExpired` instead of `UnknownSession`.
    tombstones: BTreeMap<SessionId, SessionState>,
    /// `(deadline, session, sequence)` for every held command.
    gap_deadlines: BTreeSet<(u64, SessionId, u64)>,
}

impl<A: Application> SessionStateMachine<A> {
    pub fn new(config: SessionConfig, app: A) -> Self {
        SessionStateMachine {
            config,
            app,
            status: MachineStatus::Running,
            last_applied: 0,
            now_ms: 0,
            sessions: BTreeMap::new(),
            connections: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            gap_deadlines: BTreeSet::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Apply path
    // -------------------------------------------------------------------------

    /// Apply one committed entry.
    ///
    /// Must be called once per committed entry, in log order with no index
    /// skipped. Protocol-level
    /// rejections (unknown session, sequence gap, ...) are outcomes in the
    /// report; only a broken log produces an error, and that error halts
    /// the machine.
    pub fn apply(&mut self, index: u64, bytes: &[u8]) -> Result<ApplyReport, SessionFatalError> {
        if self.status == MachineStatus::Halted {
            return Err(SessionFatalError::Halted);
        }
        if index <= self.last_applied {
            return Err(self.halt(SessionFatalError::IndexRegression {
                previous: self.last_applied,
                found: index,
            }));
        }
        // The first entry (or a restored snapshot) fixes the position; after
        // that every index must follow the previous one.
        if self.last_applied > 0 && index != self.last_applied + 1 {
            return Err(self.halt(SessionFatalError::LogGap {
                expected: self.last_applied + 1,
                found: index,
            }));
        }
        let entry = match SessionEntry::decode(bytes) {
            Ok(entry) => entry,
            Err(e) => {
                return Err(self.halt(SessionFatalError::CorruptEntry {
                    index,
                    message: e.to_string(),
                }))
            }
        };
        // Session ids are indices of earlier REGISTER entries.
        if let Some(session) = entry.kind.session() {
            if session.as_u64() >= index {
                return Err(self.halt(SessionFatalError::UnassignedSession { index, session }));
            }
        }

        self.last_applied = index;
        self.now_ms = self.now_ms.max(entry.timestamp_ms);

        let mut report = ApplyReport::new(index);
        self.reject_overdue_gaps(&mut report);

        let proposal = entry.proposal;
        match entry.kind {
            EntryKind::Register { member, connection } => {
                self.apply_register(index, proposal, member, connection, &mut report)
            }
            EntryKind::KeepAlive {
                session,
                command_sequence,
                event_sequence,
            } => self.apply_keep_alive(index, proposal, session, command_sequence, event_sequence, &mut report),
            EntryKind::Command {
                session,
                sequence,
                operation,
            } => self.apply_command(index, proposal, session, sequence, operation, &mut report),
            EntryKind::Query { session, query } => {
                let outcome = match self.check_active(session) {
                    Ok(_) => SessionOutcome::Query {
                        result: self.app.query(&query),
                    },
                    Err(status) => self.inactive(session, status),
                };
                report.push(proposal, outcome);
            }
            EntryKind::Unregister { session } => self.apply_unregister(proposal, session, &mut report),
            EntryKind::Expire { session } => self.apply_expire(proposal, session, &mut report),
        }
        Ok(report)
    }

    fn halt(&mut self, err: SessionFatalError) -> SessionFatalError {
        error!(error = %err, last_applied = self.last_applied, "session state machine halted");
        self.status = MachineStatus::Halted;
        err
    }

    fn apply_register(
        &mut self,
        index: u64,
        proposal: ProposalId,
        member: MemberId,
        connection: ConnectionId,
        report: &mut ApplyReport,
    ) {
        if let Some(&previous) = self.connections.get(&connection) {
            info!(%previous, %connection, "session superseded by re-registration");
            self.terminate(
                previous,
                SessionState::Closed,
                "session superseded by a new registration",
                report,
            );
        }

        let id = SessionId::new(index);
        let timeout_ms = self.config.session_timeout_ms;
        let mut session = Session::new(id, connection, member, self.now_ms, timeout_ms);
        debug!(session = %id, state = ?session.state, "registering");
        session.state = SessionState::Active;
        self.sessions.insert(id, session);
        self.connections.insert(connection, id);
        info!(session = %id, member, %connection, timeout_ms, "session registered");

        report.push(proposal, SessionOutcome::Registered { session: id, timeout_ms });
    }

    fn apply_keep_alive(
        &mut self,
        index: u64,
        proposal: ProposalId,
        id: SessionId,
        command_sequence: u64,
        event_sequence: u64,
        report: &mut ApplyReport,
    ) {
        let now = self.now_ms;
        let outcome = match self.sessions.get_mut(&id) {
            Some(session) => {
                // The client cannot acknowledge more than was applied.
                let acked = command_sequence.min(session.command_sequence);
                session.acknowledge(acked);
                session.event_sequence = session.event_sequence.max(event_sequence);
                session.last_keep_alive = session.last_keep_alive.max(now);
                debug!(session = %id, acked, cached = session.results.len(), "keep-alive");
                SessionOutcome::KeptAlive
            }
            None => self.inactive(id, self.absent_status(id)),
        };
        report.push(proposal, outcome);
        // Acknowledged results may have made room for held commands.
        self.drain_held(index, id, report);
    }

    fn apply_command(
        &mut self,
        index: u64,
        proposal: ProposalId,
        id: SessionId,
        sequence: u64,
        operation: Vec<u8>,
        report: &mut ApplyReport,
    ) {
        let now = self.now_ms;
        let gap_timeout = self.config.gap_timeout_ms;
        let max_cached = self.config.max_cached_results;
        let max_held = self.config.max_held_commands;

        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            None => {
                let outcome = self.inactive(id, self.absent_status(id));
                report.push(proposal, outcome);
                return;
            }
        };

        let applied = session.command_sequence;
        if sequence <= applied {
            let outcome = match session.results.get(&sequence) {
                Some(result) => {
                    debug!(session = %id, sequence, "duplicate command answered from cache");
                    SessionOutcome::Command {
                        sequence,
                        result: result.clone(),
                    }
                }
                None => {
                    warn!(session = %id, sequence, applied, "duplicate of an acknowledged command");
                    SessionOutcome::rejected(
                        Status::SequenceGap,
                        format!("result for sequence {} is no longer available", sequence),
                    )
                }
            };
            report.push(proposal, outcome);
            return;
        }

        // Unacknowledged results are never evicted, so a full cache holds
        // the next command back until a keep-alive releases some.
        let cache_full = !session.has_cache_room(max_cached);
        if sequence > applied + 1 || cache_full {
            if let Some(held) = session.held.get_mut(&sequence) {
                held.proposals.push(proposal);
                return;
            }
            if session.held.len() >= max_held {
                warn!(session = %id, sequence, applied, cache_full, "hold buffer full");
                let message = if sequence == applied + 1 {
                    format!("result cache full; acknowledge results before sequence {}", sequence)
                } else {
                    format!("expected sequence {}, got {}", applied + 1, sequence)
                };
                report.push(proposal, SessionOutcome::rejected(Status::SequenceGap, message));
                return;
            }
            debug!(session = %id, sequence, applied, cache_full, "holding command");
            session.held.insert(
                sequence,
                HeldCommand {
                    operation,
                    held_at: now,
                    proposals: vec![proposal],
                },
            );
            self.gap_deadlines
                .insert((now.saturating_add(gap_timeout), id, sequence));
            return;
        }

        let result = run_command(&mut self.app, session, index, now, sequence, &operation);
        report.push(proposal, SessionOutcome::Command { sequence, result });
        self.drain_held(index, id, report);
    }

    /// Run held commands that are now contiguous, while the result cache
    /// has room for them.
    fn drain_held(&mut self, index: u64, id: SessionId, report: &mut ApplyReport) {
        let now = self.now_ms;
        let gap_timeout = self.config.gap_timeout_ms;
        let max_cached = self.config.max_cached_results;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        while session.has_cache_room(max_cached) {
            let next = session.command_sequence + 1;
            let Some(held) = session.held.remove(&next) else {
                break;
            };
            self.gap_deadlines
                .remove(&(held.held_at.saturating_add(gap_timeout), id, next));
            debug!(session = %id, sequence = next, "draining held command");
            let result = run_command(&mut self.app, session, index, now, next, &held.operation);
            for waiting in held.proposals {
                report.push(
                    waiting,
                    SessionOutcome::Command {
                        sequence: next,
                        result: result.clone(),
                    },
                );
            }
        }
    }

    fn apply_unregister(&mut self, proposal: ProposalId, id: SessionId, report: &mut ApplyReport) {
        let outcome = if self.sessions.contains_key(&id) {
            self.terminate(id, SessionState::Closed, "session unregistered", report);
            info!(session = %id, "session closed");
            SessionOutcome::Unregistered
        } else if self.tombstones.contains_key(&id) {
            SessionOutcome::Unregistered
        } else {
            self.inactive(id, Status::UnknownSession)
        };
        report.push(proposal, outcome);
    }

    fn apply_expire(&mut self, proposal: ProposalId, id: SessionId, report: &mut ApplyReport) {
        let now = self.now_ms;
        let eligible = self
            .sessions
            .get(&id)
            .map_or(false, |session| session.is_expired_at(now));
        if eligible {
            self.terminate(id, SessionState::Expired, "session expired", report);
            info!(session = %id, now, "session expired");
        } else {
            debug!(session = %id, now, "ignoring stale expiry");
        }
        report.push(proposal, SessionOutcome::Expiry { session: id, expired: eligible });
    }

    /// Move an active session to a terminal state, cancelling held commands.
    fn terminate(&mut self, id: SessionId, state: SessionState, reason: &str, report: &mut ApplyReport) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        if self.connections.get(&session.connection) == Some(&id) {
            self.connections.remove(&session.connection);
        }
        let gap_timeout = self.config.gap_timeout_ms;
        for (sequence, held) in std::mem::take(&mut session.held) {
            self.gap_deadlines
                .remove(&(held.held_at.saturating_add(gap_timeout), id, sequence));
            for waiting in held.proposals {
                report.push(waiting, SessionOutcome::rejected(Status::SessionExpired, reason));
            }
        }
        session.state = state;
        self.tombstones.insert(id, state);
        while self.tombstones.len() > self.config.max_tombstones {
            self.tombstones.pop_first();
        }
    }

    /// Reject held commands whose wait exceeded the gap timeout.
    fn reject_overdue_gaps(&mut self, report: &mut ApplyReport) {
        let now = self.now_ms;
        while let Some(&(deadline, id, sequence)) = self.gap_deadlines.first() {
            if deadline >= now {
                break;
            }
            self.gap_deadlines.pop_first();
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let Some(held) = session.held.remove(&sequence) else {
                continue;
            };
            warn!(session = %id, sequence, applied = session.command_sequence, "gap timeout");
            let message = if sequence == session.command_sequence + 1 {
                format!("sequence {} waited too long for room in the result cache", sequence)
            } else {
                format!(
                    "sequence {} waited too long for {}",
                    sequence,
                    session.command_sequence + 1
                )
            };
            for waiting in held.proposals {
                report.push(waiting, SessionOutcome::rejected(Status::SequenceGap, message.clone()));
            }
        }
    }

    fn absent_status(&self, id: SessionId) -> Status {
        if self.tombstones.contains_key(&id) {
            Status::SessionExpired
        } else {
            Status::UnknownSession
        }
    }

    fn inactive(&self, id: SessionId, status: Status) -> SessionOutcome {
        SessionOutcome::rejected(status, format!("{} is not active", id))
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    /// The active session `id`, or the status a request naming it gets.
    pub fn check_active(&self, id: SessionId) -> Result<&Session, Status> {
        self.sessions.get(&id).ok_or_else(|| self.absent_status(id))
    }

    /// Active session lookup.
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Lifecycle state of a known session, active or tombstoned.
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        match self.sessions.get(&id) {
            Some(session) => Some(session.state),
            None => self.tombstones.get(&id).copied(),
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones.len()
    }

    /// Sequential read against locally applied state.
    pub fn query(&self, id: SessionId, query: &[u8]) -> Result<Vec<u8>, Status> {
        self.check_active(id)?;
        Ok(self.app.query(query))
    }

    /// Result of an already-applied command, if still cached.
    pub fn cached_result(&self, id: SessionId, sequence: u64) -> Option<&[u8]> {
        self.sessions.get(&id)?.cached_result(sequence)
    }

    /// Sessions whose last keep-alive is older than their timeout at `now_ms`.
    ///
    /// Only a hint for the expiry timer. The decision is made again when the
    /// resulting `Expire` entry is applied.
    pub fn expiry_candidates(&self, now_ms: u64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.is_expired_at(now_ms))
            .map(|session| session.id)
            .collect()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Consensus time of the last applied entry.
    pub fn consensus_time(&self) -> u64 {
        self.now_ms
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn is_halted(&self) -> bool {
        self.status == MachineStatus::Halted
    }

    pub fn application(&self) -> &A {
        &self.app
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Serialize sessions and application state into a checksummed snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let view = SnapshotView {
            last_applied: self.last_applied,
            now_ms: self.now_ms,
            sessions: &self.sessions,
            tombstones: &self.tombstones,
            application: self.app.snapshot().map_err(SnapshotError::Application)?,
        };
        let state = bincode::serialize(&view)?;

        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + state.len());
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.last_applied.to_le_bytes());
        out.extend_from_slice(&(state.len() as u64).to_le_bytes());
        out.extend_from_slice(&crc32c::crc32c(&state).to_le_bytes());
        let header_checksum = crc32c::crc32c(&out[0..28]);
        out.extend_from_slice(&header_checksum.to_le_bytes());
        out.extend_from_slice(&state);
        Ok(out)
    }

    /// Replace all state with a snapshot and resume applying.
    ///
    /// This is the only way out of `Halted`. If the snapshot itself is
    /// invalid, nothing changes.
    pub fn restore(&mut self, snapshot: &[u8]) -> Result<(), SnapshotError> {
        if snapshot.len() < SNAPSHOT_HEADER_SIZE {
            return Err(SnapshotError::TooSmall);
        }
        if snapshot[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = u16::from_le_bytes([snapshot[4], snapshot[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let header_checksum = read_u32(snapshot, 28);
        let actual = crc32c::crc32c(&snapshot[0..28]);
        if header_checksum != actual {
            return Err(SnapshotError::HeaderChecksumMismatch {
                expected: header_checksum,
                actual,
            });
        }
        let state = &snapshot[SNAPSHOT_HEADER_SIZE..];
        let state_size = read_u64(snapshot, 16);
        if state_size != state.len() as u64 {
            return Err(SnapshotError::StateSizeMismatch {
                expected: state_size,
                actual: state.len(),
            });
        }
        let state_checksum = read_u32(snapshot, 24);
        let actual = crc32c::crc32c(state);
        if state_checksum != actual {
            return Err(SnapshotError::StateChecksumMismatch {
                expected: state_checksum,
                actual,
            });
        }
        let decoded: SnapshotState = bincode::deserialize(state)?;

        if let Err(message) = self.app.restore(&decoded.application) {
            // The application may be half-restored; nothing it holds can be trusted.
            self.status = MachineStatus::Halted;
            return Err(SnapshotError::Application(message));
        }

        let gap_timeout = self.config.gap_timeout_ms;
        self.connections = decoded
            .sessions
            .values()
            .map(|session| (session.connection, session.id))
            .collect();
        self.gap_deadlines = decoded
            .sessions
            .values()
            .flat_map(|session| {
                session.held.iter().map(move |(sequence, held)| {
                    (held.held_at.saturating_add(gap_timeout), session.id, *sequence)
                })
            })
            .collect();
        self.sessions = decoded.sessions;
        self.tombstones = decoded.tombstones;
        self.last_applied = decoded.last_applied;
        self.now_ms = decoded.now_ms;
        self.status = MachineStatus::Running;
        info!(
            last_applied = self.last_applied,
            sessions = self.sessions.len(),
            "session state restored from snapshot"
        );
        Ok(())
    }
}

/// Apply `sequence` to the application and record its result.
fn run_command<A: Application>(
    app: &mut A,
    session: &mut Session,
    index: u64,
    now: u64,
    sequence: u64,
    operation: &[u8],
) -> Vec<u8> {
    let ctx = ApplyContext::new(index, now, session.id);
    let result = app.apply(&ctx, operation);
    session.command_sequence = sequence;
    session.cache_result(sequence, result.clone());
    result
}

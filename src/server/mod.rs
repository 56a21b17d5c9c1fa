//! Cluster-side request handling.
//!
//! A [`SessionServer`] sits between the transport and the consensus core on
//! one member:
//! - `on_client_request` decodes a request, proposes a session entry and
//!   blocks until that entry's outcome comes back from the apply loop
//! - `apply_session_entry` feeds one committed entry to the session state
//!   machine and wakes the handlers waiting on its outcomes
//!
//! # Invariants
//!
//! 1. **Leader Admission**: only the leader proposes. Followers answer
//!    `NotLeader` with the leader they know of, except for sequential
//!    queries, which any member serves from its applied state.
//! 2. **Waiter Before Propose**: a handler registers its waiter before it
//!    proposes, so an outcome can never arrive unobserved.
//! 3. **Bounded Wait**: no handler waits longer than `commit_timeout_ms`.

mod consensus;
mod timer;

#[cfg(test)]
pub(crate) mod harness;
#[cfg(test)]
mod tests;

pub use consensus::{
    Committed, ConsensusCore, LocalCluster, LocalConsensus, ProposeError, DEFAULT_RETAINED_ENTRIES,
};
pub use timer::ExpiryTimer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::client::RequestHandler;
use crate::clock::Clock;
use crate::config::{ConfigError, SessionConfig};
use crate::protocol::{
    BuildError, CodecError, Consistency, MemberId, MessagePools, QueryRequest,
    Request, Response, SessionId, SessionRef, Status,
};
use crate::session::{
    Application, ApplyReport, EntryKind, ProposalId, SessionEntry, SessionFatalError,
    SessionOutcome, SessionStateMachine, SnapshotError,
};

/// Build an error response from any response builder.
macro_rules! error_response {
    ($builder:expr, $status:expr, $message:expr, $leader:expr) => {{
        let builder = $builder.with_error($status, $message)?;
        match $leader {
            Some(leader) => builder.with_leader(leader)?.build()?,
            None => builder.build()?,
        }
    }};
}

/// Session layer of one cluster member.
pub struct SessionServer<A: Application, C: ConsensusCore> {
    consensus: C,
    config: SessionConfig,
    machine: RwLock<SessionStateMachine<A>>,
    pools: MessagePools,
    clock: Arc<dyn Clock>,
    next_proposal: AtomicU64,
    /// Handlers waiting for the outcome of their proposal.
    waiters: Mutex<HashMap<ProposalId, Sender<SessionOutcome>>>,
    /// Expiries proposed but not yet applied, with their proposal time.
    pending_expiries: Mutex<HashMap<SessionId, u64>>,
}

impl<A: Application, C: ConsensusCore> SessionServer<A, C> {
    pub fn new(config: SessionConfig, consensus: C, app: A, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(SessionServer {
            pools: MessagePools::new(config.pool_capacity),
            machine: RwLock::new(SessionStateMachine::new(config.clone(), app)),
            consensus,
            config,
            clock,
            next_proposal: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            pending_expiries: Mutex::new(HashMap::new()),
        })
    }

    pub fn member_id(&self) -> MemberId {
        self.consensus.member_id()
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.leader() == Some(self.member_id())
    }

    pub fn pools(&self) -> &MessagePools {
        &self.pools
    }

    /// Run `f` against the session state machine under a read lock.
    pub fn read<R>(&self, f: impl FnOnce(&SessionStateMachine<A>) -> R) -> R {
        f(&self.machine.read())
    }

    /// Number of handlers currently waiting for a commit.
    pub fn pending_requests(&self) -> usize {
        self.waiters.lock().len()
    }

    // =========================================================================
    // REQUEST PATH
    // =========================================================================

    /// Handle one encoded client request and return the encoded response.
    ///
    /// A request that fails to decode is returned as an error; the transport
    /// is expected to drop the connection. Every protocol-level failure is an
    /// encoded error response instead.
    pub fn on_client_request(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let request = self.pools.request_from_bytes(bytes)?;
        let response = self.handle(&request)?;
        Ok(response.to_bytes())
    }

    fn handle(&self, request: &Request) -> Result<Response, BuildError> {
        if self.machine.read().is_halted() {
            return self.reject(request, Status::ConsensusUnavailable, Some("member is halted"));
        }
        if let Request::Query(query) = request {
            if query.consistency() == Consistency::Sequential {
                return self.sequential_query(request, query);
            }
        }
        if !self.is_leader() {
            return self.reject(request, Status::NotLeader, Some("not the leader"));
        }

        // Requests for sessions this member has never seen are answered
        // without touching the log.
        if let SessionRef::Session(id) = request.session_ref() {
            if let Err(status) = self.machine.read().check_active(id) {
                let closing = matches!(request, Request::Unregister(_));
                if status == Status::UnknownSession || !closing {
                    return self.reject(request, status, None);
                }
            }
        }

        // A resend of an applied command is answered from the cache.
        if let Request::Command(command) = request {
            let cached = self
                .machine
                .read()
                .cached_result(command.session_id(), command.sequence())
                .map(<[u8]>::to_vec);
            if let Some(result) = cached {
                debug!(session = %command.session_id(), sequence = command.sequence(), "resend answered from cache");
                let outcome = SessionOutcome::Command {
                    sequence: command.sequence(),
                    result,
                };
                return self.respond(request, outcome);
            }
        }

        let outcome = self.replicate(entry_kind(request));
        self.respond(request, outcome)
    }

    fn sequential_query(&self, request: &Request, query: &QueryRequest) -> Result<Response, BuildError> {
        let result = self.machine.read().query(query.session_id(), query.query());
        match result {
            Ok(result) => self.respond(request, SessionOutcome::Query { result }),
            Err(status) => self.reject(request, status, None),
        }
    }

    /// Propose an entry and wait for its outcome.
    fn replicate(&self, kind: EntryKind) -> SessionOutcome {
        let proposal = self.next_proposal_id();
        let name = kind.name();
        let entry = SessionEntry::new(proposal, self.clock.now_ms(), kind);
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode session entry");
                return SessionOutcome::rejected(Status::ConsensusUnavailable, "entry encoding failed");
            }
        };

        let (tx, rx) = bounded(1);
        self.waiters.lock().insert(proposal, tx);

        match self.consensus.propose(bytes) {
            Ok(index) => debug!(index, entry = name, "proposed"),
            Err(e) => {
                self.waiters.lock().remove(&proposal);
                return match e {
                    ProposeError::NotLeader { .. } => {
                        SessionOutcome::rejected(Status::NotLeader, e.to_string())
                    }
                    ProposeError::Unavailable => {
                        SessionOutcome::rejected(Status::ConsensusUnavailable, e.to_string())
                    }
                };
            }
        }

        self.await_outcome(proposal, rx)
    }

    fn await_outcome(&self, proposal: ProposalId, rx: Receiver<SessionOutcome>) -> SessionOutcome {
        match rx.recv_timeout(self.config.commit_timeout()) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.waiters.lock().remove(&proposal);
                warn!(?proposal, timeout_ms = self.config.commit_timeout_ms, "commit wait timed out");
                SessionOutcome::rejected(Status::ConsensusUnavailable, "timed out waiting for commit")
            }
            Err(RecvTimeoutError::Disconnected) => {
                SessionOutcome::rejected(Status::NotLeader, "leadership lost")
            }
        }
    }

    fn next_proposal_id(&self) -> ProposalId {
        ProposalId {
            member: self.member_id(),
            seq: self.next_proposal.fetch_add(1, Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Responses
    // -------------------------------------------------------------------------

    fn respond(&self, request: &Request, outcome: SessionOutcome) -> Result<Response, BuildError> {
        let me = self.member_id();
        let response = match (request, outcome) {
            (_, SessionOutcome::Rejected { status, message }) => {
                return self.reject(request, status, message.as_deref());
            }
            (Request::Register(_), SessionOutcome::Registered { session, timeout_ms }) => {
                Response::Register(
                    self.pools
                        .register_response()
                        .with_session_id(session)?
                        .with_leader(me)?
                        .with_timeout_ms(timeout_ms)?
                        .build()?,
                )
            }
            (Request::KeepAlive(_), SessionOutcome::KeptAlive) => {
                Response::KeepAlive(self.pools.keep_alive_response().with_leader(me)?.build()?)
            }
            (Request::Command(_), SessionOutcome::Command { sequence, result }) => Response::Command(
                self.pools
                    .command_response()
                    .with_sequence(sequence)?
                    .with_result(&result)?
                    .build()?,
            ),
            (Request::Query(_), SessionOutcome::Query { result }) => {
                Response::Query(self.pools.query_response().with_result(&result)?.build()?)
            }
            (Request::Unregister(_), SessionOutcome::Unregistered) => {
                Response::Unregister(self.pools.unregister_response().build()?)
            }
            (_, other) => {
                error!(request = ?request.wire_type(), outcome = ?other, "outcome does not match request");
                return self.reject(request, Status::ConsensusUnavailable, Some("unexpected outcome"));
            }
        };
        Ok(response)
    }

    fn reject(&self, request: &Request, status: Status, message: Option<&str>) -> Result<Response, BuildError> {
        let leader = self.consensus.leader();
        let response = match request {
            Request::Register(_) => {
                Response::Register(error_response!(self.pools.register_response(), status, message, leader))
            }
            Request::KeepAlive(_) => {
                Response::KeepAlive(error_response!(self.pools.keep_alive_response(), status, message, leader))
            }
            Request::Command(_) => {
                Response::Command(error_response!(self.pools.command_response(), status, message, leader))
            }
            Request::Query(_) => {
                Response::Query(error_response!(self.pools.query_response(), status, message, leader))
            }
            Request::Unregister(_) => {
                Response::Unregister(error_response!(self.pools.unregister_response(), status, message, leader))
            }
        };
        Ok(response)
    }

    // =========================================================================
    // APPLY PATH
    // =========================================================================

    /// Apply one committed entry and hand its outcomes to waiting handlers.
    ///
    /// Called by the consensus core's apply loop once per committed entry,
    /// in log order, on every member.
    pub fn apply_session_entry(&self, index: u64, entry: &[u8]) -> Result<ApplyReport, SessionFatalError> {
        let report = self.machine.write().apply(index, entry)?;

        let me = self.member_id();
        let mut waiters = self.waiters.lock();
        for (proposal, outcome) in &report.outcomes {
            if proposal.member != me {
                continue;
            }
            if let Some(tx) = waiters.remove(proposal) {
                // The handler may have timed out already.
                let _ = tx.try_send(outcome.clone());
            }
        }
        Ok(report)
    }

    /// Fail every waiting handler with `NotLeader`. Called when this member
    /// loses leadership; entries already proposed may still commit.
    pub fn step_down(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        if !waiters.is_empty() {
            info!(member = self.member_id(), waiting = waiters.len(), "stepping down; failing waiters");
        }
        for (_, tx) in waiters {
            let _ = tx.try_send(SessionOutcome::rejected(Status::NotLeader, "leadership lost"));
        }
        self.pending_expiries.lock().clear();
    }

    // =========================================================================
    // EXPIRY
    // =========================================================================

    /// Propose an `Expire` entry for every session that looks idle.
    ///
    /// Runs on the leader only. The apply path decides again, against the
    /// entry's timestamp, so proposing for a session that has just sent a
    /// keep-alive is harmless. Returns the number of entries proposed.
    pub fn propose_expirations(&self) -> usize {
        if !self.is_leader() {
            return 0;
        }
        let now = self.clock.now_ms();
        let candidates = {
            let machine = self.machine.read();
            if machine.is_halted() {
                return 0;
            }
            machine.expiry_candidates(now)
        };

        let retry_after = self.config.commit_timeout_ms;
        let mut pending = self.pending_expiries.lock();
        pending.retain(|id, proposed_at| {
            candidates.contains(id) && now.saturating_sub(*proposed_at) < retry_after
        });

        let mut proposed = 0;
        for session in candidates {
            if pending.contains_key(&session) {
                continue;
            }
            let entry = SessionEntry::new(self.next_proposal_id(), now, EntryKind::Expire { session });
            let bytes = match entry.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(error = %e, "failed to encode expiry entry");
                    break;
                }
            };
            match self.consensus.propose(bytes) {
                Ok(index) => {
                    info!(%session, index, "proposed session expiry");
                    pending.insert(session, now);
                    proposed += 1;
                }
                Err(e) => {
                    warn!(%session, error = %e, "expiry proposal failed");
                    break;
                }
            }
        }
        proposed
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        self.machine.read().snapshot()
    }

    /// Replace local session state with a snapshot. This is how a halted
    /// member is brought back.
    pub fn install_snapshot(&self, snapshot: &[u8]) -> Result<(), SnapshotError> {
        self.machine.write().restore(snapshot)
    }
}

impl<A: Application, C: ConsensusCore> RequestHandler for SessionServer<A, C> {
    fn handle_request(&self, request: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.on_client_request(request)
    }
}

/// The session entry a request turns into.
fn entry_kind(request: &Request) -> EntryKind {
    match request {
        Request::Register(r) => EntryKind::Register {
            member: r.member(),
            connection: r.connection(),
        },
        Request::KeepAlive(r) => EntryKind::KeepAlive {
            session: r.session_id(),
            command_sequence: r.command_sequence(),
            event_sequence: r.event_sequence(),
        },
        Request::Command(r) => EntryKind::Command {
            session: r.session_id(),
            sequence: r.sequence(),
            operation: r.operation().to_vec(),
        },
        Request::Query(r) => EntryKind::Query {
            session: r.session_id(),
            query: r.query().to_vec(),
        },
        Request::Unregister(r) => EntryKind::Unregister {
            session: r.session_id(),
        },
    }
}

/// Drive `server` from a committed-entry stream until the stream closes.
///
/// A fatal error halts the state machine; the loop keeps draining the
/// stream so the member can be restored from a snapshot later.
pub fn spawn_apply_loop<A, C>(
    server: Arc<SessionServer<A, C>>,
    committed: Receiver<Committed>,
) -> std::io::Result<JoinHandle<()>>
where
    A: Application + 'static,
    C: ConsensusCore + 'static,
{
    thread::Builder::new()
        .name(format!("apply-{}", server.member_id()))
        .spawn(move || {
            for entry in committed.iter() {
                if let Err(e) = server.apply_session_entry(entry.index, &entry.entry) {
                    if !matches!(e, SessionFatalError::Halted) {
                        error!(member = server.member_id(), index = entry.index, error = %e, "apply failed");
                    }
                }
            }
            debug!(member = server.member_id(), "apply loop finished");
        })
}

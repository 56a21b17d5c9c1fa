//! Per-session replicated record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entry::ProposalId;
use crate::protocol::{ConnectionId, MemberId, SessionId};

/// Session lifecycle state.
///
/// `Registering` only exists inside the apply of the REGISTER entry; a
/// session observable from outside the apply path is `Active` or terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Registering,
    Active,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

/// A command that arrived ahead of its predecessors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldCommand {
    pub operation: Vec<u8>,
    /// Consensus time at which the command was first held.
    pub held_at: u64,
    /// Every proposal of this sequence (the original and any resends).
    pub proposals: Vec<ProposalId>,
}

/// One client session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) connection: ConnectionId,
    pub(crate) member: MemberId,
    pub(crate) command_sequence: u64,
    pub(crate) event_sequence: u64,
    pub(crate) last_keep_alive: u64,
    pub(crate) timeout_ms: u64,
    pub(crate) state: SessionState,
    /// Cached results keyed by command sequence, for deduplicating resends.
    pub(crate) results: BTreeMap<u64, Vec<u8>>,
    /// Out-of-order commands keyed by sequence.
    pub(crate) held: BTreeMap<u64, HeldCommand>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        connection: ConnectionId,
        member: MemberId,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Self {
        Session {
            id,
            connection,
            member,
            command_sequence: 0,
            event_sequence: 0,
            last_keep_alive: now_ms,
            timeout_ms,
            state: SessionState::Registering,
            results: BTreeMap::new(),
            held: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Highest command sequence applied.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Highest event sequence acknowledged by the client.
    pub fn event_sequence(&self) -> u64 {
        self.event_sequence
    }

    pub fn last_keep_alive(&self) -> u64 {
        self.last_keep_alive
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cached_result(&self, sequence: u64) -> Option<&[u8]> {
        self.results.get(&sequence).map(Vec::as_slice)
    }

    pub fn cached_results(&self) -> usize {
        self.results.len()
    }

    pub fn held_commands(&self) -> usize {
        self.held.len()
    }

    /// True once `now_ms - last_keep_alive` exceeds the timeout.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_keep_alive) > self.timeout_ms
    }

    /// Cache a result until the client acknowledges it. Nothing is evicted
    /// here; callers stop applying commands while the cache is full.
    pub(crate) fn cache_result(&mut self, sequence: u64, result: Vec<u8>) {
        self.results.insert(sequence, result);
    }

    pub(crate) fn has_cache_room(&self, max: usize) -> bool {
        self.results.len() < max
    }

    /// Drop results the client acknowledged.
    pub(crate) fn acknowledge(&mut self, sequence: u64) {
        self.results = self.results.split_off(&sequence.saturating_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionId::new(1), ConnectionId::generate(), 0, 1_000, 500)
    }

    #[test]
    fn test_expiry_boundary() {
        let s = session();
        assert!(!s.is_expired_at(1_500));
        assert!(s.is_expired_at(1_501));
        // Clock readings behind the keep-alive never expire a session.
        assert!(!s.is_expired_at(10));
    }

    #[test]
    fn test_unacknowledged_results_retained() {
        let mut s = session();
        for seq in 1..=5 {
            s.cache_result(seq, vec![seq as u8]);
        }
        assert_eq!(s.cached_results(), 5);
        assert_eq!(s.cached_result(1), Some(&[1u8][..]));
        assert!(!s.has_cache_room(5));

        s.acknowledge(1);
        assert!(s.has_cache_room(5));
    }

    #[test]
    fn test_acknowledge_evicts_prefix() {
        let mut s = session();
        for seq in 1..=4 {
            s.cache_result(seq, vec![]);
        }
        s.acknowledge(2);
        assert!(s.cached_result(2).is_none());
        assert!(s.cached_result(3).is_some());
        assert_eq!(s.cached_results(), 2);
    }
}

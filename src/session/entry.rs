//! Session log entries.
//!
//! Every client request that changes (or must observe) replicated session
//! state is turned into a [`SessionEntry`] by the member that received it and
//! proposed to the consensus core. The entry carries the proposer's clock
//! reading, which becomes the consensus time for everything its apply does.

use serde::{Deserialize, Serialize};

use crate::protocol::{ConnectionId, MemberId, SessionId};

/// Identifies one proposal so its outcome can be routed back to the request
/// handler waiting on the proposing member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalId {
    /// Member that proposed the entry.
    pub member: MemberId,
    /// Member-local counter.
    pub seq: u64,
}

/// Operation carried by a session entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Register {
        member: MemberId,
        connection: ConnectionId,
    },
    KeepAlive {
        session: SessionId,
        command_sequence: u64,
        event_sequence: u64,
    },
    Command {
        session: SessionId,
        sequence: u64,
        operation: Vec<u8>,
    },
    /// Linearizable read. Goes through the log so it observes every entry
    /// committed before it.
    Query {
        session: SessionId,
        query: Vec<u8>,
    },
    Unregister {
        session: SessionId,
    },
    /// Proposed by the expiry timer. Re-checked at apply time.
    Expire {
        session: SessionId,
    },
}

impl EntryKind {
    /// Session the entry targets. `None` for registration.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            EntryKind::Register { .. } => None,
            EntryKind::KeepAlive { session, .. }
            | EntryKind::Command { session, .. }
            | EntryKind::Query { session, .. }
            | EntryKind::Unregister { session }
            | EntryKind::Expire { session } => Some(*session),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::Register { .. } => "register",
            EntryKind::KeepAlive { .. } => "keep_alive",
            EntryKind::Command { .. } => "command",
            EntryKind::Query { .. } => "query",
            EntryKind::Unregister { .. } => "unregister",
            EntryKind::Expire { .. } => "expire",
        }
    }
}

/// A session operation as it appears in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub proposal: ProposalId,
    /// Proposer wall clock in milliseconds.
    pub timestamp_ms: u64,
    pub kind: EntryKind,
}

impl SessionEntry {
    pub fn new(proposal: ProposalId, timestamp_ms: u64, kind: EntryKind) -> Self {
        SessionEntry {
            proposal,
            timestamp_ms,
            kind,
        }
    }

    /// Serialize for proposal.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a committed entry.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_session_target() {
        let register = EntryKind::Register {
            member: 1,
            connection: ConnectionId::generate(),
        };
        assert_eq!(register.session(), None);

        let expire = EntryKind::Expire {
            session: SessionId::new(7),
        };
        assert_eq!(expire.session(), Some(SessionId::new(7)));
        assert_eq!(expire.name(), "expire");
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(SessionEntry::decode(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}

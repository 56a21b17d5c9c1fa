//! Consensus core seam and an in-process stand-in.
//!
//! Leader election and log replication live outside this crate. The session
//! layer only needs three things from them: who it is, who leads, and a way
//! to append an entry. Committed entries come back through the member's
//! apply loop in log order.
//!
//! [`LocalCluster`] provides all of that over crossbeam channels for tests
//! and the demo binary: one shared log, one committed-entry stream per member.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::protocol::MemberId;

/// The consensus core as seen by the session layer.
pub trait ConsensusCore: Send + Sync {
    fn member_id(&self) -> MemberId;

    /// Current leader, if one is known.
    fn leader(&self) -> Option<MemberId>;

    /// Append an entry to the log. Returns its index. Commitment is reported
    /// separately, through the apply loop.
    fn propose(&self, entry: Vec<u8>) -> Result<u64, ProposeError>;
}

/// Why a proposal was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposeError {
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<MemberId> },

    #[error("no quorum available")]
    Unavailable,
}

/// A committed entry delivered to a member.
#[derive(Debug, Clone)]
pub struct Committed {
    pub index: u64,
    pub entry: Arc<[u8]>,
}

// =============================================================================
// LOCAL CLUSTER
// =============================================================================

const NO_LEADER: i32 = -1;

/// Delivered entries a [`LocalCluster`] keeps for late subscribers.
pub const DEFAULT_RETAINED_ENTRIES: usize = 4096;

struct ClusterLog {
    next_index: u64,
    last_index: Option<u64>,
    entries: Vec<Committed>,
    /// Entries below this position were delivered to subscribers.
    delivered: usize,
    /// Delivered entries kept after a flush.
    retain: usize,
    paused: bool,
    subscribers: Vec<(MemberId, Sender<Committed>)>,
}

impl ClusterLog {
    fn flush(&mut self) {
        if self.paused {
            return;
        }
        let pending = &self.entries[self.delivered..];
        self.subscribers.retain(|(member, tx)| {
            let alive = pending.iter().all(|committed| tx.send(committed.clone()).is_ok());
            if !alive {
                debug!(member = *member, "dropping closed subscriber");
            }
            alive
        });
        self.delivered = self.entries.len();

        let excess = self.delivered.saturating_sub(self.retain);
        if excess > 0 {
            self.entries.drain(..excess);
            self.delivered -= excess;
        }
    }
}

struct ClusterShared {
    size: usize,
    log: Mutex<ClusterLog>,
    leader: AtomicI32,
    available: AtomicBool,
}

/// An in-process cluster whose log commits every accepted proposal at once.
///
/// Proposals are accepted only from the current leader while the cluster is
/// available. Delivery can be paused to simulate a slow quorum.
#[derive(Clone)]
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    /// Create a cluster of `size` members (ids `0..size`) whose first log
    /// index is `first_index`. Member 0 starts as leader.
    pub fn new(size: usize, first_index: u64) -> Self {
        LocalCluster::with_retention(size, first_index, DEFAULT_RETAINED_ENTRIES)
    }

    /// Like [`LocalCluster::new`], keeping only the last `retain` delivered
    /// entries. Older entries are dropped once every subscriber has them.
    pub fn with_retention(size: usize, first_index: u64, retain: usize) -> Self {
        LocalCluster {
            shared: Arc::new(ClusterShared {
                size,
                log: Mutex::new(ClusterLog {
                    next_index: first_index.max(1),
                    last_index: None,
                    entries: Vec::new(),
                    delivered: 0,
                    retain,
                    paused: false,
                    subscribers: Vec::new(),
                }),
                leader: AtomicI32::new(if size > 0 { 0 } else { NO_LEADER }),
                available: AtomicBool::new(true),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Consensus handle for one member.
    pub fn member(&self, id: MemberId) -> LocalConsensus {
        LocalConsensus {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Committed-entry stream for `member`, starting from the oldest retained
    /// entry. A member subscribing after entries were dropped must be
    /// brought up to date with a snapshot.
    pub fn subscribe(&self, member: MemberId) -> Receiver<Committed> {
        let (tx, rx) = unbounded();
        let mut log = self.shared.log.lock();
        for committed in &log.entries[..log.delivered] {
            // The receiver is alive; it is returned below.
            let _ = tx.send(committed.clone());
        }
        log.subscribers.push((member, tx));
        rx
    }

    pub fn set_leader(&self, leader: Option<MemberId>) {
        self.shared
            .leader
            .store(leader.unwrap_or(NO_LEADER), Ordering::SeqCst);
    }

    pub fn leader(&self) -> Option<MemberId> {
        leader_of(&self.shared)
    }

    /// Simulate quorum loss (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Hold accepted entries back from the apply loops.
    pub fn pause_delivery(&self) {
        self.shared.log.lock().paused = true;
    }

    /// Deliver everything held back and resume immediate delivery.
    pub fn resume_delivery(&self) {
        let mut log = self.shared.log.lock();
        log.paused = false;
        log.flush();
    }

    /// Index of the last accepted entry, if any.
    pub fn last_index(&self) -> Option<u64> {
        self.shared.log.lock().last_index
    }

    /// Close every committed-entry stream so apply loops exit.
    pub fn shutdown(&self) {
        self.shared.log.lock().subscribers.clear();
    }
}

fn leader_of(shared: &ClusterShared) -> Option<MemberId> {
    match shared.leader.load(Ordering::SeqCst) {
        NO_LEADER => None,
        id => Some(id),
    }
}

/// One member's view of a [`LocalCluster`].
#[derive(Clone)]
pub struct LocalConsensus {
    id: MemberId,
    shared: Arc<ClusterShared>,
}

impl ConsensusCore for LocalConsensus {
    fn member_id(&self) -> MemberId {
        self.id
    }

    fn leader(&self) -> Option<MemberId> {
        leader_of(&self.shared)
    }

    fn propose(&self, entry: Vec<u8>) -> Result<u64, ProposeError> {
        let leader = leader_of(&self.shared);
        if leader != Some(self.id) {
            return Err(ProposeError::NotLeader { leader });
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(ProposeError::Unavailable);
        }

        // Appending and delivering under one lock keeps every member's
        // stream in log order.
        let mut log = self.shared.log.lock();
        let index = log.next_index;
        log.next_index += 1;
        log.last_index = Some(index);
        log.entries.push(Committed {
            index,
            entry: entry.into(),
        });
        log.flush();
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_leader_proposes() {
        let cluster = LocalCluster::new(3, 1);
        assert_eq!(cluster.member(0).propose(vec![1]), Ok(1));
        assert_eq!(
            cluster.member(1).propose(vec![2]),
            Err(ProposeError::NotLeader { leader: Some(0) })
        );

        cluster.set_leader(None);
        assert_eq!(
            cluster.member(0).propose(vec![3]),
            Err(ProposeError::NotLeader { leader: None })
        );
    }

    #[test]
    fn test_unavailable_cluster_rejects() {
        let cluster = LocalCluster::new(3, 1);
        cluster.set_available(false);
        assert_eq!(cluster.member(0).propose(vec![1]), Err(ProposeError::Unavailable));
        assert_eq!(cluster.last_index(), None);
    }

    #[test]
    fn test_every_member_sees_log_order() {
        let cluster = LocalCluster::new(2, 42);
        let early = cluster.subscribe(0);
        let leader = cluster.member(0);
        leader.propose(b"a".to_vec()).unwrap();
        leader.propose(b"b".to_vec()).unwrap();
        // A late subscriber replays the retained entries.
        let late = cluster.subscribe(1);

        for rx in [early, late] {
            let indices: Vec<u64> = rx.try_iter().map(|c| c.index).collect();
            assert_eq!(indices, vec![42, 43]);
        }
    }

    #[test]
    fn test_delivered_entries_trimmed_to_retention() {
        let cluster = LocalCluster::with_retention(1, 1, 2);
        let early = cluster.subscribe(0);
        for i in 0..5u8 {
            cluster.member(0).propose(vec![i]).unwrap();
        }
        assert_eq!(cluster.shared.log.lock().entries.len(), 2);
        assert_eq!(cluster.last_index(), Some(5));

        let all: Vec<u64> = early.try_iter().map(|c| c.index).collect();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
        let late: Vec<u64> = cluster.subscribe(1).try_iter().map(|c| c.index).collect();
        assert_eq!(late, vec![4, 5]);
    }

    #[test]
    fn test_paused_entries_kept_until_delivered() {
        let cluster = LocalCluster::with_retention(1, 1, 1);
        let rx = cluster.subscribe(0);
        cluster.pause_delivery();
        for i in 0..3u8 {
            cluster.member(0).propose(vec![i]).unwrap();
        }
        assert_eq!(cluster.shared.log.lock().entries.len(), 3);

        cluster.resume_delivery();
        let indices: Vec<u64> = rx.try_iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(cluster.shared.log.lock().entries.len(), 1);
    }

    #[test]
    fn test_paused_delivery_holds_entries() {
        let cluster = LocalCluster::new(1, 1);
        let rx = cluster.subscribe(0);
        cluster.pause_delivery();
        cluster.member(0).propose(vec![7]).unwrap();
        assert!(rx.try_recv().is_err());

        cluster.resume_delivery();
        let committed = rx.try_recv().unwrap();
        assert_eq!(committed.index, 1);
        assert_eq!(&committed.entry[..], &[7]);
    }
}

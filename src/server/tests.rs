//! Request path tests against a running in-process cluster.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::harness::{wait_for, KvServer, TestCluster, FIRST_INDEX};
use super::*;
use crate::clock::ManualClock;
use crate::kv::KvStore;
use crate::protocol::{ClientResponse, ConnectionId, SessionId};
use crate::session::SessionState;

fn send(server: &KvServer, request: &Request) -> Response {
    let bytes = server.on_client_request(&request.to_bytes()).unwrap();
    server.pools().response_from_bytes(&bytes).unwrap()
}

fn register(pools: &MessagePools) -> Request {
    Request::Register(
        pools
            .register_request()
            .with_member(0)
            .unwrap()
            .with_connection(ConnectionId::generate())
            .unwrap()
            .build()
            .unwrap(),
    )
}

fn command(pools: &MessagePools, session: SessionId, sequence: u64, op: &str) -> Request {
    Request::Command(
        pools
            .command_request()
            .with_session_id(session)
            .unwrap()
            .with_sequence(sequence)
            .unwrap()
            .with_operation(op.as_bytes())
            .unwrap()
            .build()
            .unwrap(),
    )
}

fn keep_alive(pools: &MessagePools, session: SessionId, acked: u64) -> Request {
    Request::KeepAlive(
        pools
            .keep_alive_request()
            .with_session_id(session)
            .unwrap()
            .with_command_sequence(acked)
            .unwrap()
            .with_event_sequence(0)
            .unwrap()
            .build()
            .unwrap(),
    )
}

fn query(pools: &MessagePools, session: SessionId, consistency: Consistency, q: &str) -> Request {
    Request::Query(
        pools
            .query_request()
            .with_session_id(session)
            .unwrap()
            .with_consistency(consistency)
            .with_query(q.as_bytes())
            .unwrap()
            .build()
            .unwrap(),
    )
}

fn register_session(server: &KvServer) -> SessionId {
    match send(server, &register(server.pools())) {
        Response::Register(r) if r.status() == Status::Ok => r.session_id(),
        other => panic!("registration failed: {:?}", other),
    }
}

fn command_result(response: Response) -> Vec<u8> {
    match response {
        Response::Command(r) if r.status() == Status::Ok => r.result().to_vec(),
        other => panic!("expected command result, got {:?}", other),
    }
}

fn fast_commit() -> SessionConfig {
    SessionConfig {
        commit_timeout_ms: 50,
        ..SessionConfig::default()
    }
}

// =============================================================================
// REGISTRATION AND COMMANDS
// =============================================================================

#[test]
fn test_register_returns_log_index() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let response = send(tc.leader(), &register(tc.leader().pools()));

    let Response::Register(registered) = response else {
        panic!("wrong response type");
    };
    assert_eq!(registered.status(), Status::Ok);
    assert_eq!(registered.session_id(), SessionId::new(FIRST_INDEX));
    assert_eq!(registered.leader(), Some(0));
    assert_eq!(registered.timeout_ms(), SessionConfig::default().session_timeout_ms);

    tc.wait_all(|m| m.session_state(SessionId::new(FIRST_INDEX)) == Some(SessionState::Active));
}

#[test]
fn test_resent_command_applied_once() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let leader = tc.leader();
    let session = register_session(leader);

    let request = command(leader.pools(), session, 1, "INCR hits");
    assert_eq!(command_result(send(leader, &request)), b"1");
    // Identical bytes, as a client resends after losing the reply.
    assert_eq!(command_result(send(leader, &request)), b"1");

    assert_eq!(tc.cluster.last_index(), Some(FIRST_INDEX + 1));
    tc.wait_all(|m| m.application().get("hits") == Some("1") && m.application().applied() == 1);
}

#[test]
fn test_unknown_session_rejected_without_proposal() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let response = send(tc.leader(), &keep_alive(tc.leader().pools(), SessionId::new(99), 0));

    assert_eq!(response.status(), Status::UnknownSession);
    assert_eq!(tc.cluster.last_index(), None);
}

#[test]
fn test_follower_redirects_to_leader() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let follower = &tc.servers[1];
    let response = send(follower, &register(follower.pools()));

    assert_eq!(response.status(), Status::NotLeader);
    assert_eq!(response.leader(), Some(0));
    assert_eq!(tc.cluster.last_index(), None);
}

#[test]
fn test_no_leader_reported_as_none() {
    let tc = TestCluster::start(3, SessionConfig::default());
    tc.cluster.set_leader(None);
    let response = send(tc.leader(), &register(tc.leader().pools()));

    assert_eq!(response.status(), Status::NotLeader);
    assert_eq!(response.leader(), None);
}

// =============================================================================
// QUERIES
// =============================================================================

#[test]
fn test_sequential_query_served_by_follower() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let leader = tc.leader();
    let session = register_session(leader);
    command_result(send(leader, &command(leader.pools(), session, 1, "SET color blue")));
    tc.wait_all(|m| m.application().get("color") == Some("blue"));

    let follower = &tc.servers[2];
    let response = send(follower, &query(follower.pools(), session, Consistency::Sequential, "GET color"));
    let Response::Query(answered) = response else {
        panic!("wrong response type");
    };
    assert_eq!(answered.status(), Status::Ok);
    assert_eq!(answered.result(), b"blue");

    // Nothing was logged for it.
    assert_eq!(tc.cluster.last_index(), Some(FIRST_INDEX + 1));
}

#[test]
fn test_linearizable_query_goes_through_log() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let leader = tc.leader();
    let session = register_session(leader);
    command_result(send(leader, &command(leader.pools(), session, 1, "SET k v")));

    let follower = &tc.servers[1];
    let redirected = send(follower, &query(follower.pools(), session, Consistency::Linearizable, "GET k"));
    assert_eq!(redirected.status(), Status::NotLeader);

    let response = send(leader, &query(leader.pools(), session, Consistency::Linearizable, "GET k"));
    let Response::Query(answered) = response else {
        panic!("wrong response type");
    };
    assert_eq!(answered.result(), b"v");
    assert_eq!(tc.cluster.last_index(), Some(FIRST_INDEX + 2));
}

// =============================================================================
// CONSENSUS FAILURES
// =============================================================================

#[test]
fn test_unavailable_cluster_answers_consensus_unavailable() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let leader = tc.leader();
    let session = register_session(leader);

    tc.cluster.set_available(false);
    let response = send(leader, &command(leader.pools(), session, 1, "SET a 1"));
    assert_eq!(response.status(), Status::ConsensusUnavailable);
    assert_eq!(leader.pending_requests(), 0);
}

#[test]
fn test_commit_timeout_then_resend_hits_cache() {
    let tc = TestCluster::start(3, fast_commit());
    let leader = tc.leader();
    let session = register_session(leader);

    tc.cluster.pause_delivery();
    let request = command(leader.pools(), session, 1, "INCR n");
    let response = send(leader, &request);
    assert_eq!(response.status(), Status::ConsensusUnavailable);
    assert_eq!(leader.pending_requests(), 0);

    // The entry was accepted and commits late.
    tc.cluster.resume_delivery();
    wait_for(|| leader.read(|m| m.cached_result(session, 1).is_some()));

    assert_eq!(command_result(send(leader, &request)), b"1");
    assert_eq!(leader.read(|m| m.application().applied()), 1);
}

#[test]
fn test_step_down_fails_waiting_handlers() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let session = register_session(tc.leader());

    tc.cluster.pause_delivery();
    let server = Arc::clone(&tc.servers[0]);
    let bytes = command(server.pools(), session, 1, "SET a 1").to_bytes();
    let waiting = thread::spawn(move || server.on_client_request(&bytes).unwrap());

    wait_for(|| tc.leader().pending_requests() == 1);
    tc.leader().step_down();

    let reply = waiting.join().unwrap();
    let response = tc.leader().pools().response_from_bytes(&reply).unwrap();
    assert_eq!(response.status(), Status::NotLeader);
    assert_eq!(tc.leader().pending_requests(), 0);
}

// =============================================================================
// EXPIRY
// =============================================================================

fn short_sessions() -> SessionConfig {
    SessionConfig {
        session_timeout_ms: 1_000,
        ..SessionConfig::default()
    }
}

#[test]
fn test_expiry_timer_expires_idle_session_everywhere() {
    let tc = TestCluster::start(3, short_sessions());
    let session = register_session(tc.leader());

    let mut timer = ExpiryTimer::start(Arc::clone(&tc.servers[0]), Duration::from_millis(5)).unwrap();
    assert!(timer.is_running());
    tc.clock.advance(1_500);

    tc.wait_all(|m| m.session_state(session) == Some(SessionState::Expired));
    timer.stop();
    assert!(!timer.is_running());

    let response = send(tc.leader(), &keep_alive(tc.leader().pools(), session, 0));
    assert_eq!(response.status(), Status::SessionExpired);
}

#[test]
fn test_keep_alive_defers_expiry() {
    let tc = TestCluster::start(3, short_sessions());
    let leader = tc.leader();
    let session = register_session(leader);

    tc.clock.advance(800);
    assert_eq!(send(leader, &keep_alive(leader.pools(), session, 0)).status(), Status::Ok);
    tc.clock.advance(800);

    assert_eq!(leader.propose_expirations(), 0);
    assert_eq!(leader.read(|m| m.session_state(session)), Some(SessionState::Active));
}

#[test]
fn test_expiry_proposed_once_while_pending() {
    let tc = TestCluster::start(3, short_sessions());
    register_session(tc.leader());
    tc.clock.advance(2_000);

    assert_eq!(tc.servers[1].propose_expirations(), 0);

    tc.cluster.pause_delivery();
    assert_eq!(tc.leader().propose_expirations(), 1);
    assert_eq!(tc.leader().propose_expirations(), 0);

    // Still unapplied after the commit timeout: proposed again.
    tc.clock.advance(SessionConfig::default().commit_timeout_ms);
    assert_eq!(tc.leader().propose_expirations(), 1);
}

// =============================================================================
// MALFORMED INPUT AND RECOVERY
// =============================================================================

#[test]
fn test_malformed_request_is_an_error() {
    let tc = TestCluster::start(1, SessionConfig::default());
    assert!(tc.leader().on_client_request(&[0xff, 0xff, 0x01]).is_err());
    assert!(tc.leader().on_client_request(&[]).is_err());
    assert_eq!(tc.cluster.last_index(), None);
}

#[test]
fn test_halted_member_recovers_from_snapshot() {
    // Driven by hand, without an apply loop.
    let cluster = LocalCluster::new(1, FIRST_INDEX);
    let server = SessionServer::new(
        SessionConfig::default(),
        cluster.member(0),
        KvStore::new(),
        Arc::new(ManualClock::new(1_000)),
    )
    .unwrap();

    let entry = SessionEntry::new(
        ProposalId { member: 0, seq: 1 },
        1_000,
        EntryKind::Register {
            member: 0,
            connection: ConnectionId::generate(),
        },
    );
    server.apply_session_entry(FIRST_INDEX, &entry.encode().unwrap()).unwrap();
    let snapshot = server.snapshot().unwrap();

    let err = server.apply_session_entry(FIRST_INDEX + 1, b"garbage").unwrap_err();
    assert!(matches!(err, SessionFatalError::CorruptEntry { .. }));
    assert!(server.read(|m| m.is_halted()));
    let session = SessionId::new(FIRST_INDEX);
    let response = send(&server, &keep_alive(server.pools(), session, 0));
    assert_eq!(response.status(), Status::ConsensusUnavailable);

    server.install_snapshot(&snapshot).unwrap();
    assert!(!server.read(|m| m.is_halted()));
    assert_eq!(server.read(|m| m.last_applied()), FIRST_INDEX);
    assert_eq!(server.read(|m| m.session_state(session)), Some(SessionState::Active));
}

#[test]
fn test_invalid_config_rejected() {
    let cluster = LocalCluster::new(1, 1);
    let config = SessionConfig {
        commit_timeout_ms: 0,
        ..SessionConfig::default()
    };
    let result = SessionServer::new(config, cluster.member(0), KvStore::new(), Arc::new(ManualClock::new(0)));
    assert!(matches!(result, Err(ConfigError { field: "commit_timeout_ms" })));
}

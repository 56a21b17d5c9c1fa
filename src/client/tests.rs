//! Client driver tests against a running in-process cluster.

use super::*;
use crate::config::SessionConfig;
use crate::server::harness::{TestCluster, FIRST_INDEX};
use crate::session::SessionState;

#[test]
fn test_new_requires_members() {
    let result = SessionClient::new(LocalTransport::new(), Vec::new(), ClientConfig::default());
    assert!(matches!(result, Err(ClientError::NoMembers)));
}

#[test]
fn test_register_then_submit() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client(3);
    assert_eq!(client.state(), ClientState::Unregistered);

    let session = client.register().unwrap();
    assert_eq!(session, SessionId::new(FIRST_INDEX));
    assert_eq!(client.state(), ClientState::Active);
    assert_eq!(client.timeout_ms(), SessionConfig::default().session_timeout_ms);

    assert_eq!(client.submit(b"INCR n").unwrap(), b"1");
    assert_eq!(client.submit(b"INCR n").unwrap(), b"2");
    assert_eq!(client.command_sequence(), 2);
    assert_eq!(client.acked_sequence(), 2);
    assert_eq!(client.query(b"GET n", Consistency::Linearizable).unwrap(), b"2");
}

#[test]
fn test_follower_redirects_client() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client(3);
    client.set_target(2);

    client.register().unwrap();
    assert_eq!(client.target_member(), 0);
    assert_eq!(tc.transport.sent(), 2);
}

#[test]
fn test_unreachable_member_skipped() {
    let tc = TestCluster::start(3, SessionConfig::default());
    tc.cluster.set_leader(Some(1));
    tc.transport.set_down(0, true);
    let mut client = tc.client(3);

    assert_eq!(client.register().unwrap(), SessionId::new(FIRST_INDEX));
    assert_eq!(client.target_member(), 1);
}

#[test]
fn test_lost_reply_resent_and_applied_once() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client(3);
    let session = client.register().unwrap();

    tc.transport.drop_replies(0, 1);
    assert_eq!(client.submit(b"INCR n").unwrap(), b"1");
    assert_eq!(client.command_sequence(), 1);

    // One command entry in the log, one application on every member.
    assert_eq!(tc.cluster.last_index(), Some(FIRST_INDEX + 1));
    tc.wait_all(|m| m.application().applied() == 1 && m.cached_result(session, 1) == Some(&b"1"[..]));
}

#[test]
fn test_keep_alive_releases_cached_results() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client(3);
    let session = client.register().unwrap();
    client.submit(b"SET a 1").unwrap();
    client.submit(b"SET b 2").unwrap();
    assert!(tc.leader().read(|m| m.cached_result(session, 2).is_some()));

    client.keep_alive().unwrap();
    tc.wait_all(|m| m.session(session).map_or(false, |s| s.cached_results() == 0));
}

#[test]
fn test_session_lost_after_expiry() {
    let config = SessionConfig {
        session_timeout_ms: 1_000,
        ..SessionConfig::default()
    };
    let tc = TestCluster::start(3, config);
    let mut client = tc.client(3);
    let first = client.register().unwrap();

    tc.clock.advance(5_000);
    assert_eq!(tc.leader().propose_expirations(), 1);
    tc.wait_all(|m| m.session_state(first) == Some(SessionState::Expired));

    let err = client.submit(b"SET a 1").unwrap_err();
    assert!(matches!(
        err,
        ClientError::SessionLost { session, status: Status::SessionExpired } if session == first
    ));
    assert_eq!(client.state(), ClientState::Lost);
    assert_eq!(client.session_id(), None);

    // Registration, expiry, then the new registration.
    let second = client.register().unwrap();
    assert_eq!(second, SessionId::new(FIRST_INDEX + 2));
    assert_eq!(client.command_sequence(), 0);
    assert_eq!(client.submit(b"SET a 1").unwrap(), b"");
}

#[test]
fn test_retries_exhausted_when_unavailable() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client(2);
    client.register().unwrap();

    tc.cluster.set_available(false);
    let err = client.submit(b"SET a 1").unwrap_err();
    assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3 }));
    // The sequence number stays consumed.
    assert_eq!(client.command_sequence(), 1);
    assert_eq!(client.state(), ClientState::Active);
}

#[test]
fn test_closed_client_rejects_requests_locally() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client(3);
    let session = client.register().unwrap();

    client.unregister().unwrap();
    assert_eq!(client.state(), ClientState::Closed);
    tc.wait_all(|m| m.session_state(session) == Some(SessionState::Closed));

    let sent = tc.transport.sent();
    assert!(matches!(client.submit(b"SET a 1"), Err(ClientError::NotRegistered)));
    assert!(matches!(client.keep_alive(), Err(ClientError::NotRegistered)));
    assert_eq!(tc.transport.sent(), sent);
}

#[test]
fn test_no_backoff_after_final_attempt() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client_with(ClientConfig {
        max_retries: 0,
        base_backoff_ms: 5_000,
        max_backoff_ms: 5_000,
        request_timeout_ms: 100,
        ..ClientConfig::default()
    });
    client.register().unwrap();

    tc.cluster.set_available(false);
    let started = std::time::Instant::now();
    let err = client.submit(b"SET a 1").unwrap_err();
    assert!(matches!(err, ClientError::RetriesExhausted { attempts: 1 }));
    assert!(started.elapsed() < std::time::Duration::from_secs(1));
}

#[test]
fn test_submit_acknowledges_results_periodically() {
    let tc = TestCluster::start(3, SessionConfig::default());
    let mut client = tc.client_with(ClientConfig {
        base_backoff_ms: 1,
        max_backoff_ms: 4,
        max_unacknowledged: 2,
        ..ClientConfig::default()
    });
    let session = client.register().unwrap();
    for _ in 0..3 {
        client.submit(b"INCR n").unwrap();
    }

    // Register, three commands and one keep-alive acknowledging the first two.
    assert_eq!(tc.transport.sent(), 5);
    tc.wait_all(|m| m.session(session).map_or(false, |s| s.cached_results() == 1));
}

#[test]
fn test_submit_refreshes_idle_session() {
    let config = SessionConfig {
        session_timeout_ms: 20,
        ..SessionConfig::default()
    };
    let tc = TestCluster::start(3, config);
    let mut client = tc.client(3);
    client.register().unwrap();
    assert!(!client.keep_alive_due());

    std::thread::sleep(std::time::Duration::from_millis(15));
    assert!(client.keep_alive_due());
    let sent = tc.transport.sent();
    client.submit(b"SET a 1").unwrap();
    // The keep-alive goes out ahead of the command.
    assert_eq!(tc.transport.sent(), sent + 2);
}

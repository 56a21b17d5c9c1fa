//! In-process cluster wiring shared by the server and client tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{spawn_apply_loop, LocalCluster, LocalConsensus, SessionServer};
use crate::client::{LocalTransport, SessionClient};
use crate::clock::ManualClock;
use crate::config::{ClientConfig, SessionConfig};
use crate::kv::KvStore;
use crate::protocol::MemberId;
use crate::session::SessionStateMachine;

pub(crate) type KvServer = SessionServer<KvStore, LocalConsensus>;

/// First log index of every test cluster.
pub(crate) const FIRST_INDEX: u64 = 42;

/// A running cluster: one server and one apply loop per member, all
/// reachable through a shared [`LocalTransport`]. Member 0 leads.
pub(crate) struct TestCluster {
    pub cluster: LocalCluster,
    pub servers: Vec<Arc<KvServer>>,
    pub transport: Arc<LocalTransport>,
    pub clock: ManualClock,
    apply_loops: Vec<JoinHandle<()>>,
}

impl TestCluster {
    pub fn start(size: usize, config: SessionConfig) -> Self {
        let cluster = LocalCluster::new(size, FIRST_INDEX);
        let clock = ManualClock::new(1_000);
        let transport = Arc::new(LocalTransport::new());
        let mut servers = Vec::with_capacity(size);
        let mut apply_loops = Vec::with_capacity(size);

        for id in 0..size as MemberId {
            let server = Arc::new(
                SessionServer::new(config.clone(), cluster.member(id), KvStore::new(), Arc::new(clock.clone()))
                    .unwrap(),
            );
            apply_loops.push(spawn_apply_loop(Arc::clone(&server), cluster.subscribe(id)).unwrap());
            transport.connect(id, server.clone());
            servers.push(server);
        }

        TestCluster {
            cluster,
            servers,
            transport,
            clock,
            apply_loops,
        }
    }

    pub fn leader(&self) -> &KvServer {
        &self.servers[0]
    }

    /// A client that knows every member, with millisecond backoff.
    pub fn client(&self, max_retries: u32) -> SessionClient<Arc<LocalTransport>> {
        self.client_with(ClientConfig {
            max_retries,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            request_timeout_ms: 100,
            ..ClientConfig::default()
        })
    }

    pub fn client_with(&self, config: ClientConfig) -> SessionClient<Arc<LocalTransport>> {
        let members = (0..self.servers.len() as MemberId).collect();
        SessionClient::new(Arc::clone(&self.transport), members, config).unwrap()
    }

    /// Wait until `check` holds on every member.
    pub fn wait_all(&self, check: impl Fn(&SessionStateMachine<KvStore>) -> bool) {
        wait_for(|| self.servers.iter().all(|server| server.read(&check)));
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.cluster.shutdown();
        for handle in self.apply_loops.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Poll `condition` until it holds. Panics after five seconds.
pub(crate) fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

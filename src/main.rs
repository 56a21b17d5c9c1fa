//! Demo driver: runs an in-process cluster and walks a client through the
//! session protocol.

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chronon_session::client::{ClientError, LocalTransport, SessionClient};
use chronon_session::clock::{Clock, SystemClock};
use chronon_session::config::{ClientConfig, SessionConfig};
use chronon_session::kv::KvStore;
use chronon_session::protocol::{Consistency, MemberId};
use chronon_session::server::{spawn_apply_loop, ExpiryTimer, LocalCluster, LocalConsensus, SessionServer};
use chronon_session::session::{SessionState, SessionStateMachine};

type KvServer = SessionServer<KvStore, LocalConsensus>;

#[derive(Parser)]
#[command(name = "chronon-session", version, about = "Client session protocol demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register, submit commands, lose a reply and resend it.
    Scenario {
        #[arg(long, default_value_t = 3)]
        members: usize,
        #[arg(long, default_value_t = 5)]
        commands: u32,
    },
    /// Let a session go idle until every replica expires it.
    Expiry {
        #[arg(long, default_value_t = 3)]
        members: usize,
        #[arg(long, default_value_t = 300)]
        timeout_ms: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Scenario { members, commands } => run_scenario(members, commands),
        Command::Expiry { members, timeout_ms } => run_expiry(members, timeout_ms),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "demo failed");
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// CLUSTER WIRING
// =============================================================================

struct Demo {
    cluster: LocalCluster,
    servers: Vec<Arc<KvServer>>,
    transport: Arc<LocalTransport>,
    apply_loops: Vec<JoinHandle<()>>,
}

impl Demo {
    fn start(members: usize, config: SessionConfig) -> Result<Self, Box<dyn Error>> {
        if members == 0 {
            return Err("a cluster needs at least one member".into());
        }
        let cluster = LocalCluster::new(members, 1);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let transport = Arc::new(LocalTransport::new());
        let mut servers = Vec::with_capacity(members);
        let mut apply_loops = Vec::with_capacity(members);

        for id in 0..members as MemberId {
            let server = Arc::new(SessionServer::new(
                config.clone(),
                cluster.member(id),
                KvStore::new(),
                Arc::clone(&clock),
            )?);
            apply_loops.push(spawn_apply_loop(Arc::clone(&server), cluster.subscribe(id))?);
            transport.connect(id, server.clone());
            servers.push(server);
        }
        info!(members, "cluster started");
        Ok(Demo {
            cluster,
            servers,
            transport,
            apply_loops,
        })
    }

    fn client(&self) -> Result<SessionClient<Arc<LocalTransport>>, ClientError> {
        let members = (0..self.servers.len() as MemberId).collect();
        let config = ClientConfig {
            base_backoff_ms: 10,
            ..ClientConfig::default()
        };
        SessionClient::new(Arc::clone(&self.transport), members, config)
    }

    /// Wait until `check` holds on every member.
    fn settle(&self, within: Duration, check: impl Fn(&SessionStateMachine<KvStore>) -> bool) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if self.servers.iter().all(|server| server.read(&check)) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn report(&self) {
        for server in &self.servers {
            server.read(|m| {
                println!(
                    "  member {}: last_applied={} sessions={} tombstones={} applied_commands={}",
                    server.member_id(),
                    m.last_applied(),
                    m.active_sessions(),
                    m.tombstones(),
                    m.application().applied(),
                )
            });
        }
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        self.cluster.shutdown();
        for handle in self.apply_loops.drain(..) {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

fn run_scenario(members: usize, commands: u32) -> Result<(), Box<dyn Error>> {
    let demo = Demo::start(members, SessionConfig::default())?;
    let mut client = demo.client()?;

    // Start at the last member so the first request is redirected.
    client.set_target((members - 1) as MemberId);
    let session = client.register()?;
    println!("registered {} via member {}", session, client.target_member());

    for _ in 0..commands {
        let result = client.submit(b"INCR counter")?;
        println!("INCR counter -> {}", String::from_utf8_lossy(&result));
    }

    let leader = client.target_member();
    demo.transport.drop_replies(leader, 1);
    let result = client.submit(b"SET greeting hello")?;
    println!(
        "SET greeting (reply lost once, resent as sequence {}) -> {:?}",
        client.command_sequence(),
        String::from_utf8_lossy(&result)
    );

    client.keep_alive()?;
    let expected = u64::from(commands) + 1;
    if !demo.settle(Duration::from_secs(2), |m| m.application().applied() == expected) {
        return Err("replicas did not converge".into());
    }

    let answer = client.query(b"GET counter", Consistency::Linearizable)?;
    println!("GET counter -> {}", String::from_utf8_lossy(&answer));

    client.unregister()?;
    println!("closed {}", session);
    demo.report();
    Ok(())
}

fn run_expiry(members: usize, timeout_ms: u64) -> Result<(), Box<dyn Error>> {
    let config = SessionConfig {
        session_timeout_ms: timeout_ms,
        expiry_check_interval_ms: (timeout_ms / 5).max(10),
        ..SessionConfig::default()
    };
    let interval = config.expiry_check_interval();
    let demo = Demo::start(members, config)?;
    let _timer = ExpiryTimer::start(Arc::clone(&demo.servers[0]), interval)?;

    let mut client = demo.client()?;
    let session = client.register()?;
    client.submit(b"SET owner demo")?;
    println!("registered {}; going idle for {}ms", session, timeout_ms);

    let within = Duration::from_millis(timeout_ms.saturating_mul(10).max(1_000));
    if !demo.settle(within, |m| m.session_state(session) == Some(SessionState::Expired)) {
        return Err("session was not expired on every replica".into());
    }
    println!("{} expired on all {} members", session, members);

    match client.keep_alive() {
        Err(ClientError::SessionLost { status, .. }) => println!("keep-alive -> {}", status),
        Err(e) => return Err(e.into()),
        Ok(()) => return Err("expired session accepted a keep-alive".into()),
    }

    let renewed = client.register()?;
    println!("re-registered as {}", renewed);
    demo.report();
    Ok(())
}

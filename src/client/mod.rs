//! Client-side session driver.
//!
//! A [`SessionClient`] owns one session with the cluster and hides the
//! protocol's failure handling from its caller:
//! - every command gets the next sequence number before it is first sent,
//!   and a resend after a timeout is byte-for-byte the same request
//! - `NotLeader` redirects to the reported leader, or the next member when
//!   none is known
//! - `ConsensusUnavailable` and transport timeouts back off exponentially
//! - `UnknownSession` / `SessionExpired` end the session; the caller decides
//!   whether to `register()` again
//!
//! The client has no background thread. `submit` and `query` send a
//! keep-alive first when one is due, so a client that keeps issuing
//! requests keeps its session. A caller that may sit idle for longer than
//! [`SessionClient::timeout_ms`] must call [`SessionClient::keep_alive`]
//! itself, for example whenever [`SessionClient::keep_alive_due`] is true.

mod transport;

#[cfg(test)]
mod tests;

pub use transport::{LocalTransport, RequestHandler, Transport, TransportError};

use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::protocol::{
    encode_frame, BuildError, ClientResponse, CodecError, ConnectionId, Consistency, MemberId,
    MessagePools, Response, SessionId, Status, WireMessage, WireType,
};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no cluster members configured")]
    NoMembers,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no active session")]
    NotRegistered,

    /// The cluster no longer knows the session. Register again to continue.
    #[error("{session} lost: {status}")]
    SessionLost { session: SessionId, status: Status },

    #[error("request rejected: {status}")]
    Rejected { status: Status, message: Option<String> },

    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("unexpected response type {0:?}")]
    UnexpectedResponse(WireType),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("malformed response: {0}")]
    Codec(#[from] CodecError),
}

/// Local view of the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unregistered,
    Active,
    /// The cluster expired or forgot the session.
    Lost,
    Closed,
}

// =============================================================================
// SESSION CLIENT
// =============================================================================

pub struct SessionClient<T: Transport> {
    transport: T,
    pools: MessagePools,
    config: ClientConfig,
    members: Vec<MemberId>,
    /// Index into `members` of the next request's destination.
    target: usize,
    connection: ConnectionId,
    session: Option<SessionId>,
    state: ClientState,
    timeout_ms: u64,
    /// Last command sequence handed out. Never reused.
    command_sequence: u64,
    /// Highest command sequence whose response was received.
    acked_sequence: u64,
    /// `acked_sequence` as of the last keep-alive the cluster accepted.
    reported_ack: u64,
    event_sequence: u64,
    /// When the cluster last confirmed the session was alive.
    last_keep_alive: Option<Instant>,
}

impl<T: Transport> SessionClient<T> {
    pub fn new(transport: T, members: Vec<MemberId>, config: ClientConfig) -> Result<Self, ClientError> {
        if members.is_empty() {
            return Err(ClientError::NoMembers);
        }
        config.validate()?;
        Ok(SessionClient {
            transport,
            pools: MessagePools::default(),
            config,
            members,
            target: 0,
            connection: ConnectionId::generate(),
            session: None,
            state: ClientState::Unregistered,
            timeout_ms: 0,
            command_sequence: 0,
            acked_sequence: 0,
            reported_ack: 0,
            event_sequence: 0,
            last_keep_alive: None,
        })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Session timeout granted by the cluster.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    pub fn acked_sequence(&self) -> u64 {
        self.acked_sequence
    }

    /// True once half the session timeout has passed since the session was
    /// last refreshed.
    pub fn keep_alive_due(&self) -> bool {
        match (self.state, self.last_keep_alive) {
            (ClientState::Active, Some(at)) => at.elapsed() >= Duration::from_millis(self.timeout_ms / 2),
            _ => false,
        }
    }

    /// Member the next request goes to.
    pub fn target_member(&self) -> MemberId {
        self.members[self.target]
    }

    /// Send the next request to `member` first.
    pub fn set_target(&mut self, member: MemberId) {
        if let Some(position) = self.members.iter().position(|&m| m == member) {
            self.target = position;
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Open a session. Replaces any session this client held before.
    pub fn register(&mut self) -> Result<SessionId, ClientError> {
        let request = self
            .pools
            .register_request()
            .with_member(self.target_member())?
            .with_connection(self.connection)?
            .build()?;
        let response = self.exchange(&frame(&*request), WireType::RegisterResponse)?;
        let Response::Register(registered) = response else {
            return Err(ClientError::UnexpectedResponse(response.wire_type()));
        };

        let session = registered.session_id();
        self.session = Some(session);
        self.state = ClientState::Active;
        self.timeout_ms = registered.timeout_ms();
        self.command_sequence = 0;
        self.acked_sequence = 0;
        self.reported_ack = 0;
        self.event_sequence = 0;
        self.last_keep_alive = Some(Instant::now());
        if let Some(leader) = registered.leader() {
            self.set_target(leader);
        }
        info!(%session, connection = %self.connection, timeout_ms = self.timeout_ms, "session registered");
        Ok(session)
    }

    /// Refresh the session and acknowledge received command results.
    pub fn keep_alive(&mut self) -> Result<(), ClientError> {
        let session = self.active_session()?;
        let acked = self.acked_sequence;
        let request = self
            .pools
            .keep_alive_request()
            .with_session_id(session)?
            .with_command_sequence(acked)?
            .with_event_sequence(self.event_sequence)?
            .build()?;
        self.exchange(&frame(&*request), WireType::KeepAliveResponse)?;
        self.reported_ack = acked;
        self.last_keep_alive = Some(Instant::now());
        Ok(())
    }

    /// Keep-alive ahead of a request when the session needs refreshing or
    /// enough results wait to be acknowledged.
    fn refresh_if_due(&mut self) -> Result<(), ClientError> {
        let unreported = self.acked_sequence - self.reported_ack;
        if self.keep_alive_due() || unreported >= self.config.max_unacknowledged {
            debug!(unreported, "sending keep-alive before request");
            self.keep_alive()?;
        }
        Ok(())
    }

    /// Submit a command and return its result. Applied exactly once, however
    /// many times the request has to be resent.
    pub fn submit(&mut self, operation: &[u8]) -> Result<Vec<u8>, ClientError> {
        let session = self.active_session()?;
        self.refresh_if_due()?;
        self.command_sequence += 1;
        let sequence = self.command_sequence;
        let request = self
            .pools
            .command_request()
            .with_session_id(session)?
            .with_sequence(sequence)?
            .with_operation(operation)?
            .build()?;
        let response = self.exchange(&frame(&*request), WireType::CommandResponse)?;
        let Response::Command(applied) = response else {
            return Err(ClientError::UnexpectedResponse(response.wire_type()));
        };
        self.acked_sequence = self.acked_sequence.max(applied.sequence());
        Ok(applied.result().to_vec())
    }

    pub fn query(&mut self, query: &[u8], consistency: Consistency) -> Result<Vec<u8>, ClientError> {
        let session = self.active_session()?;
        self.refresh_if_due()?;
        let request = self
            .pools
            .query_request()
            .with_session_id(session)?
            .with_consistency(consistency)
            .with_query(query)?
            .build()?;
        let response = self.exchange(&frame(&*request), WireType::QueryResponse)?;
        let Response::Query(answered) = response else {
            return Err(ClientError::UnexpectedResponse(response.wire_type()));
        };
        Ok(answered.result().to_vec())
    }

    /// Close the session.
    pub fn unregister(&mut self) -> Result<(), ClientError> {
        let session = self.active_session()?;
        let request = self.pools.unregister_request().with_session_id(session)?.build()?;
        self.exchange(&frame(&*request), WireType::UnregisterResponse)?;
        self.session = None;
        self.state = ClientState::Closed;
        info!(%session, "session closed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Retry loop
    // -------------------------------------------------------------------------

    fn active_session(&self) -> Result<SessionId, ClientError> {
        match (self.state, self.session) {
            (ClientState::Active, Some(session)) => Ok(session),
            _ => Err(ClientError::NotRegistered),
        }
    }

    /// Send `request` until it gets a definitive answer.
    ///
    /// The same bytes are resent every time, so a command keeps its
    /// sequence number across retries and redirects.
    fn exchange(&mut self, request: &[u8], expected: WireType) -> Result<Response, ClientError> {
        for attempt in 0..=self.config.max_retries {
            let member = self.target_member();
            let bytes = match self.transport.send(member, request, self.config.request_timeout()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(member, attempt, error = %e, "request failed; resending");
                    if !matches!(e, TransportError::Timeout { .. }) {
                        self.rotate();
                    }
                    self.pause(attempt);
                    continue;
                }
            };

            let response = self.pools.response_from_bytes(&bytes)?;
            if response.wire_type() != expected {
                return Err(ClientError::UnexpectedResponse(response.wire_type()));
            }

            match response.status() {
                Status::Ok => return Ok(response),
                Status::NotLeader => {
                    debug!(member, leader = ?response.leader(), "redirected");
                    match response.leader() {
                        Some(leader) if leader != member => self.set_target(leader),
                        _ => {
                            self.rotate();
                            self.pause(attempt);
                        }
                    }
                }
                Status::ConsensusUnavailable => {
                    debug!(member, attempt, "cluster unavailable; backing off");
                    self.pause(attempt);
                }
                status @ (Status::UnknownSession | Status::SessionExpired) => {
                    return Err(match self.session.take() {
                        Some(session) => {
                            warn!(%session, %status, "session lost");
                            self.state = ClientState::Lost;
                            ClientError::SessionLost { session, status }
                        }
                        None => ClientError::Rejected {
                            status,
                            message: response.error_message().map(str::to_owned),
                        },
                    });
                }
                status @ Status::SequenceGap => {
                    return Err(ClientError::Rejected {
                        status,
                        message: response.error_message().map(str::to_owned),
                    });
                }
            }
        }
        Err(ClientError::RetriesExhausted {
            attempts: self.config.max_retries + 1,
        })
    }

    fn rotate(&mut self) {
        self.target = (self.target + 1) % self.members.len();
    }

    /// Exponential backoff with up to 25% jitter. Nothing to wait for after
    /// the last attempt.
    fn pause(&self, attempt: u32) {
        if attempt >= self.config.max_retries {
            return;
        }
        let base = self.config.backoff(attempt);
        let spread = (base.as_millis() as u64) / 4;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        thread::sleep(base + Duration::from_millis(jitter));
    }
}

fn frame<M: WireMessage>(message: &M) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_frame(message, &mut out);
    out
}

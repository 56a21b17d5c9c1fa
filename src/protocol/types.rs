//! Identifiers and small enums shared by every message type.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::buffer::TOKEN_SIZE;
use super::error::{BuildError, CodecError};

/// Cluster member identifier. Negative values never reach the wire.
pub type MemberId = i32;

/// Wire encoding of "no known leader".
pub(crate) const NO_LEADER: i32 = -1;

// =============================================================================
// SESSION ID
// =============================================================================

/// Session identifier, equal to the log index of the committed REGISTER entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        SessionId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

// =============================================================================
// CONNECTION ID
// =============================================================================

/// Client-generated token used to re-associate a session across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        ConnectionId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        self.0.as_bytes()
    }

    /// The all-zero token, which is never a valid connection.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        ConnectionId(uuid)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// CONSISTENCY
// =============================================================================

/// Read consistency requested by a QUERY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Consistency {
    /// May observe slightly stale, but causally ordered, state. Served locally.
    #[default]
    Sequential = 0,
    /// Observes the latest committed state. Routed through the log.
    Linearizable = 1,
}

impl Consistency {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Consistency::Sequential),
            1 => Ok(Consistency::Linearizable),
            other => Err(CodecError::InvalidEnum {
                field: "consistency",
                value: other,
            }),
        }
    }
}

// =============================================================================
// WIRE TYPE
// =============================================================================

/// Stable numeric tag identifying a message shape on the wire.
///
/// Tags are assigned once and never reused for a different layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum WireType {
    RegisterRequest = 272,
    RegisterResponse = 273,
    KeepAliveRequest = 274,
    KeepAliveResponse = 275,
    CommandRequest = 276,
    CommandResponse = 277,
    QueryRequest = 278,
    QueryResponse = 279,
    UnregisterRequest = 280,
    UnregisterResponse = 281,
}

impl WireType {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Result<Self, CodecError> {
        let wire_type = match tag {
            272 => WireType::RegisterRequest,
            273 => WireType::RegisterResponse,
            274 => WireType::KeepAliveRequest,
            275 => WireType::KeepAliveResponse,
            276 => WireType::CommandRequest,
            277 => WireType::CommandResponse,
            278 => WireType::QueryRequest,
            279 => WireType::QueryResponse,
            280 => WireType::UnregisterRequest,
            281 => WireType::UnregisterResponse,
            other => return Err(CodecError::UnknownType(other)),
        };
        Ok(wire_type)
    }

    pub fn is_request(self) -> bool {
        self.tag() % 2 == 0
    }
}

// =============================================================================
// FIELD VALIDATION
// =============================================================================

pub(crate) fn check_member(field: &'static str, member: MemberId) -> Result<MemberId, BuildError> {
    if member < 0 {
        return Err(BuildError::invalid(field, "cannot be negative"));
    }
    Ok(member)
}

/// Ids and sequence numbers travel as `int64` and must be strictly positive.
pub(crate) fn check_positive(field: &'static str, value: u64) -> Result<u64, BuildError> {
    if value == 0 {
        return Err(BuildError::invalid(field, "must be positive"));
    }
    if value > i64::MAX as u64 {
        return Err(BuildError::invalid(field, "exceeds int64 range"));
    }
    Ok(value)
}

/// Counters reported by the client may be zero but never exceed `int64`.
pub(crate) fn check_counter(field: &'static str, value: u64) -> Result<u64, BuildError> {
    if value > i64::MAX as u64 {
        return Err(BuildError::invalid(field, "exceeds int64 range"));
    }
    Ok(value)
}

pub(crate) fn check_timeout(field: &'static str, millis: u64) -> Result<u64, BuildError> {
    check_positive(field, millis)
}

pub(crate) fn check_payload(field: &'static str, len: usize) -> Result<(), BuildError> {
    if len > super::buffer::MAX_PAYLOAD_SIZE as usize {
        return Err(BuildError::invalid(field, format!("{} bytes exceeds maximum", len)));
    }
    Ok(())
}

/// Convert a wire `int64` into an unsigned value, rejecting negatives.
pub(crate) fn from_wire(field: &'static str, value: i64) -> Result<u64, BuildError> {
    u64::try_from(value).map_err(|_| BuildError::invalid(field, "cannot be negative"))
}

pub(crate) fn leader_to_wire(leader: Option<MemberId>) -> i32 {
    leader.unwrap_or(NO_LEADER)
}

pub(crate) fn leader_from_wire(value: i32) -> Result<Option<MemberId>, BuildError> {
    match value {
        NO_LEADER => Ok(None),
        v if v < 0 => Err(BuildError::invalid("leader", "cannot be negative")),
        v => Ok(Some(v)),
    }
}

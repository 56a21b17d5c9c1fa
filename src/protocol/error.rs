//! Protocol error types and response status codes.

use thiserror::Error;

// =============================================================================
// BUILD ERRORS
// =============================================================================

/// Local, synchronous failure while constructing a message.
///
/// These indicate a programming error in the caller and never leave the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A field was given a value outside its domain.
    #[error("invalid argument for `{field}`: {reason}")]
    InvalidArgument {
        field: &'static str,
        reason: String,
    },

    /// A required field was never set before `build()`.
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },
}

impl BuildError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        BuildError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(field: &'static str) -> Self {
        BuildError::MissingField { field }
    }
}

// =============================================================================
// CODEC ERRORS
// =============================================================================

/// Failure while encoding or decoding a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The frame carries a type tag no message is registered under.
    #[error("unknown wire type tag {0}")]
    UnknownType(u16),

    /// The input ended before the field could be read.
    #[error("truncated frame reading `{field}`: need {needed} bytes, have {remaining}")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// A length prefix exceeds the maximum payload size.
    #[error("length prefix {len} for `{field}` exceeds maximum {max}")]
    LengthTooLarge {
        field: &'static str,
        len: u32,
        max: u32,
    },

    /// An enumerated byte has no defined meaning.
    #[error("invalid value {value} for `{field}`")]
    InvalidEnum { field: &'static str, value: u8 },

    /// A string field is not valid UTF-8.
    #[error("`{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// Bytes were left over after the message was fully decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The decoded fields do not form a valid message.
    #[error("decoded message is invalid: {0}")]
    Invalid(#[from] BuildError),
}

// =============================================================================
// RESPONSE STATUS
// =============================================================================

/// Status carried by every response.
///
/// Everything other than `Ok` is a protocol-level error the client driver
/// can recover from (re-register, redirect, or retry with backoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Status {
    #[default]
    Ok = 0,
    /// The session id is not recognized.
    UnknownSession = 1,
    /// The session is known but no longer active; the client must re-register.
    SessionExpired = 2,
    /// Command sequence out of the allowed order.
    SequenceGap = 3,
    /// The request reached a non-leader member.
    NotLeader = 4,
    /// No committed leader or quorum lost. Retriable.
    ConsensusUnavailable = 5,
}

impl Status {
    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire status byte.
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::UnknownSession),
            2 => Ok(Status::SessionExpired),
            3 => Ok(Status::SequenceGap),
            4 => Ok(Status::NotLeader),
            5 => Ok(Status::ConsensusUnavailable),
            other => Err(CodecError::InvalidEnum {
                field: "status",
                value: other,
            }),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// True if retrying the identical request later may succeed.
    pub fn is_retriable(self) -> bool {
        matches!(self, Status::NotLeader | Status::ConsensusUnavailable)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::UnknownSession => "UNKNOWN_SESSION",
            Status::SessionExpired => "SESSION_EXPIRED",
            Status::SequenceGap => "SEQUENCE_GAP",
            Status::NotLeader => "NOT_LEADER",
            Status::ConsensusUnavailable => "CONSENSUS_UNAVAILABLE",
        };
        f.write_str(name)
    }
}

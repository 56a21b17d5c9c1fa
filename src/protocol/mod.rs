//! Client session wire protocol.
//!
//! This module defines the request/response message model that carries
//! session traffic between clients and the cluster:
//! - Typed, validated request and response variants with builders
//! - A per-type object pool so hot paths reuse message buffers
//! - A deterministic binary codec keyed by a stable `u16` type tag
//!
//! # Invariants
//!
//! 1. **Immutable Messages**: once `build()` returns, a message has no public
//!    mutator. Only its builder writes fields.
//! 2. **Validated Decode**: decoding goes through the same builders, so a
//!    decoded message satisfies every build-time check.
//! 3. **Scrubbed Reuse**: pooled instances are reset when released; an
//!    acquired instance never carries a previous user's data.
//! 4. **Stable Tags**: a wire tag is never reused for a different layout.

pub mod buffer;
pub mod error;
pub mod message;
pub mod pool;
pub mod request;
pub mod response;
pub mod types;


pub use buffer::{BufferInput, BufferOutput, MAX_PAYLOAD_SIZE};
pub use error::{BuildError, CodecError, Status};
pub use message::{encode_frame, Message, MessagePools, Request, Response};
pub use pool::{Pool, PoolStats, Poolable, Pooled};
pub use request::{
    ClientRequest, CommandRequest, KeepAliveRequest, QueryRequest, RegisterRequest, SessionRef,
    UnregisterRequest, WireMessage,
};
pub use response::{
    ClientResponse, CommandResponse, KeepAliveResponse, QueryResponse, RegisterResponse,
    UnregisterResponse,
};
pub use types::{ConnectionId, Consistency, MemberId, SessionId, WireType};

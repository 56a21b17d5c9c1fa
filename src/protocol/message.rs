//! Tagged message unions, frame codec and the per-type pool registry.
//!
//! # Frame layout
//!
//! ```text
//! [type_tag: u16][payload: type-specific, fields in declared order]
//! ```
//!
//! Decoding reads the tag once, dispatches to the matching builder, reads the
//! payload through its setters and finishes with `build()`, so a decoded
//! message passes the same validation as a locally built one.

use super::buffer::{BufferInput, BufferOutput};
use super::error::{CodecError, Status};
use super::pool::{Pool, Pooled, DEFAULT_POOL_CAPACITY};
use super::request::{
    ClientRequest, CommandRequest, CommandRequestBuilder, KeepAliveRequest,
    KeepAliveRequestBuilder, QueryRequest, QueryRequestBuilder, RegisterRequest,
    RegisterRequestBuilder, SessionRef, UnregisterRequest, UnregisterRequestBuilder, WireMessage,
};
use super::response::{
    ClientResponse, CommandResponse, CommandResponseBuilder, KeepAliveResponse,
    KeepAliveResponseBuilder, QueryResponse, QueryResponseBuilder, RegisterResponse,
    RegisterResponseBuilder, UnregisterResponse, UnregisterResponseBuilder,
};
use super::types::{MemberId, WireType};

/// Write a full frame (tag + payload) for any message.
pub fn encode_frame<M: WireMessage, B: BufferOutput + ?Sized>(message: &M, out: &mut B) {
    out.write_u16(M::WIRE_TYPE.tag());
    message.encode_payload(out);
}

// =============================================================================
// REQUEST
// =============================================================================

/// Any client request.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Register(Pooled<RegisterRequest>),
    KeepAlive(Pooled<KeepAliveRequest>),
    Command(Pooled<CommandRequest>),
    Query(Pooled<QueryRequest>),
    Unregister(Pooled<UnregisterRequest>),
}

impl Request {
    pub fn wire_type(&self) -> WireType {
        match self {
            Request::Register(m) => m.wire_type(),
            Request::KeepAlive(m) => m.wire_type(),
            Request::Command(m) => m.wire_type(),
            Request::Query(m) => m.wire_type(),
            Request::Unregister(m) => m.wire_type(),
        }
    }

    pub fn session_ref(&self) -> SessionRef {
        match self {
            Request::Register(m) => m.session_ref(),
            Request::KeepAlive(m) => m.session_ref(),
            Request::Command(m) => m.session_ref(),
            Request::Query(m) => m.session_ref(),
            Request::Unregister(m) => m.session_ref(),
        }
    }

    pub fn encode<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        match self {
            Request::Register(m) => encode_frame(&**m, out),
            Request::KeepAlive(m) => encode_frame(&**m, out),
            Request::Command(m) => encode_frame(&**m, out),
            Request::Query(m) => encode_frame(&**m, out),
            Request::Unregister(m) => encode_frame(&**m, out),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

/// Any cluster response.
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Register(Pooled<RegisterResponse>),
    KeepAlive(Pooled<KeepAliveResponse>),
    Command(Pooled<CommandResponse>),
    Query(Pooled<QueryResponse>),
    Unregister(Pooled<UnregisterResponse>),
}

impl Response {
    pub fn wire_type(&self) -> WireType {
        match self {
            Response::Register(m) => m.wire_type(),
            Response::KeepAlive(m) => m.wire_type(),
            Response::Command(m) => m.wire_type(),
            Response::Query(m) => m.wire_type(),
            Response::Unregister(m) => m.wire_type(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Register(m) => m.status(),
            Response::KeepAlive(m) => m.status(),
            Response::Command(m) => m.status(),
            Response::Query(m) => m.status(),
            Response::Unregister(m) => m.status(),
        }
    }

    pub fn leader(&self) -> Option<MemberId> {
        match self {
            Response::Register(m) => m.leader(),
            Response::KeepAlive(m) => m.leader(),
            Response::Command(m) => m.leader(),
            Response::Query(m) => m.leader(),
            Response::Unregister(m) => m.leader(),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Response::Register(m) => m.error_message(),
            Response::KeepAlive(m) => m.error_message(),
            Response::Command(m) => m.error_message(),
            Response::Query(m) => m.error_message(),
            Response::Unregister(m) => m.error_message(),
        }
    }

    pub fn encode<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        match self {
            Response::Register(m) => encode_frame(&**m, out),
            Response::KeepAlive(m) => encode_frame(&**m, out),
            Response::Command(m) => encode_frame(&**m, out),
            Response::Query(m) => encode_frame(&**m, out),
            Response::Unregister(m) => encode_frame(&**m, out),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }
}

/// Any frame on the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn wire_type(&self) -> WireType {
        match self {
            Message::Request(r) => r.wire_type(),
            Message::Response(r) => r.wire_type(),
        }
    }

    pub fn encode<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        match self {
            Message::Request(r) => r.encode(out),
            Message::Response(r) => r.encode(out),
        }
    }
}

// =============================================================================
// POOL REGISTRY
// =============================================================================

/// One pool per concrete message type.
///
/// Each pool has its own lock, so encoding command responses never contends
/// with decoding keep-alives. Cloning shares the underlying pools.
#[derive(Debug, Clone)]
pub struct MessagePools {
    register_request: Pool<RegisterRequest>,
    register_response: Pool<RegisterResponse>,
    keep_alive_request: Pool<KeepAliveRequest>,
    keep_alive_response: Pool<KeepAliveResponse>,
    command_request: Pool<CommandRequest>,
    command_response: Pool<CommandResponse>,
    query_request: Pool<QueryRequest>,
    query_response: Pool<QueryResponse>,
    unregister_request: Pool<UnregisterRequest>,
    unregister_response: Pool<UnregisterResponse>,
}

impl MessagePools {
    pub fn new(capacity: usize) -> Self {
        MessagePools {
            register_request: Pool::new(capacity),
            register_response: Pool::new(capacity),
            keep_alive_request: Pool::new(capacity),
            keep_alive_response: Pool::new(capacity),
            command_request: Pool::new(capacity),
            command_response: Pool::new(capacity),
            query_request: Pool::new(capacity),
            query_response: Pool::new(capacity),
            unregister_request: Pool::new(capacity),
            unregister_response: Pool::new(capacity),
        }
    }

    pub fn register_request(&self) -> RegisterRequestBuilder {
        RegisterRequestBuilder::new(self.register_request.acquire())
    }

    pub fn register_request_from(&self, existing: &RegisterRequest) -> RegisterRequestBuilder {
        RegisterRequestBuilder::copy_of(self.register_request.acquire(), existing)
    }

    pub fn keep_alive_request(&self) -> KeepAliveRequestBuilder {
        KeepAliveRequestBuilder::new(self.keep_alive_request.acquire())
    }

    pub fn keep_alive_request_from(&self, existing: &KeepAliveRequest) -> KeepAliveRequestBuilder {
        KeepAliveRequestBuilder::copy_of(self.keep_alive_request.acquire(), existing)
    }

    pub fn command_request(&self) -> CommandRequestBuilder {
        CommandRequestBuilder::new(self.command_request.acquire())
    }

    pub fn command_request_from(&self, existing: &CommandRequest) -> CommandRequestBuilder {
        CommandRequestBuilder::copy_of(self.command_request.acquire(), existing)
    }

    pub fn query_request(&self) -> QueryRequestBuilder {
        QueryRequestBuilder::new(self.query_request.acquire())
    }

    pub fn query_request_from(&self, existing: &QueryRequest) -> QueryRequestBuilder {
        QueryRequestBuilder::copy_of(self.query_request.acquire(), existing)
    }

    pub fn unregister_request(&self) -> UnregisterRequestBuilder {
        UnregisterRequestBuilder::new(self.unregister_request.acquire())
    }

    pub fn unregister_request_from(&self, existing: &UnregisterRequest) -> UnregisterRequestBuilder {
        UnregisterRequestBuilder::copy_of(self.unregister_request.acquire(), existing)
    }

    pub fn register_response(&self) -> RegisterResponseBuilder {
        RegisterResponseBuilder::new(self.register_response.acquire())
    }

    pub fn register_response_from(&self, existing: &RegisterResponse) -> RegisterResponseBuilder {
        RegisterResponseBuilder::copy_of(self.register_response.acquire(), existing)
    }

    pub fn keep_alive_response(&self) -> KeepAliveResponseBuilder {
        KeepAliveResponseBuilder::new(self.keep_alive_response.acquire())
    }

    pub fn keep_alive_response_from(&self, existing: &KeepAliveResponse) -> KeepAliveResponseBuilder {
        KeepAliveResponseBuilder::copy_of(self.keep_alive_response.acquire(), existing)
    }

    pub fn command_response(&self) -> CommandResponseBuilder {
        CommandResponseBuilder::new(self.command_response.acquire())
    }

    pub fn command_response_from(&self, existing: &CommandResponse) -> CommandResponseBuilder {
        CommandResponseBuilder::copy_of(self.command_response.acquire(), existing)
    }

    pub fn query_response(&self) -> QueryResponseBuilder {
        QueryResponseBuilder::new(self.query_response.acquire())
    }

    pub fn query_response_from(&self, existing: &QueryResponse) -> QueryResponseBuilder {
        QueryResponseBuilder::copy_of(self.query_response.acquire(), existing)
    }

    pub fn unregister_response(&self) -> UnregisterResponseBuilder {
        UnregisterResponseBuilder::new(self.unregister_response.acquire())
    }

    pub fn unregister_response_from(&self, existing: &UnregisterResponse) -> UnregisterResponseBuilder {
        UnregisterResponseBuilder::copy_of(self.unregister_response.acquire(), existing)
    }

    /// Pool for command requests, exposed for stats and tests.
    pub fn command_request_pool(&self) -> &Pool<CommandRequest> {
        &self.command_request
    }

    pub fn command_response_pool(&self) -> &Pool<CommandResponse> {
        &self.command_response
    }

    // -------------------------------------------------------------------------
    // Decoding
    // -------------------------------------------------------------------------

    /// Decode one frame of any type from a stream.
    pub fn decode<I: BufferInput + ?Sized>(&self, input: &mut I) -> Result<Message, CodecError> {
        let wire_type = WireType::from_tag(input.read_u16("type_tag")?)?;
        if wire_type.is_request() {
            self.decode_request_body(wire_type, input).map(Message::Request)
        } else {
            self.decode_response_body(wire_type, input).map(Message::Response)
        }
    }

    /// Decode one request frame from a stream.
    pub fn decode_request<I: BufferInput + ?Sized>(&self, input: &mut I) -> Result<Request, CodecError> {
        let tag = input.read_u16("type_tag")?;
        let wire_type = WireType::from_tag(tag)?;
        if !wire_type.is_request() {
            return Err(CodecError::UnknownType(tag));
        }
        self.decode_request_body(wire_type, input)
    }

    /// Decode one response frame from a stream.
    pub fn decode_response<I: BufferInput + ?Sized>(&self, input: &mut I) -> Result<Response, CodecError> {
        let tag = input.read_u16("type_tag")?;
        let wire_type = WireType::from_tag(tag)?;
        if wire_type.is_request() {
            return Err(CodecError::UnknownType(tag));
        }
        self.decode_response_body(wire_type, input)
    }

    /// Decode a request that must occupy `bytes` exactly.
    pub fn request_from_bytes(&self, bytes: &[u8]) -> Result<Request, CodecError> {
        let mut input = bytes;
        let request = self.decode_request(&mut input)?;
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes(input.len()));
        }
        Ok(request)
    }

    /// Decode a response that must occupy `bytes` exactly.
    pub fn response_from_bytes(&self, bytes: &[u8]) -> Result<Response, CodecError> {
        let mut input = bytes;
        let response = self.decode_response(&mut input)?;
        if !input.is_empty() {
            return Err(CodecError::TrailingBytes(input.len()));
        }
        Ok(response)
    }

    fn decode_request_body<I: BufferInput + ?Sized>(
        &self,
        wire_type: WireType,
        input: &mut I,
    ) -> Result<Request, CodecError> {
        let request = match wire_type {
            WireType::RegisterRequest => Request::Register(self.register_request().decode(input)?),
            WireType::KeepAliveRequest => Request::KeepAlive(self.keep_alive_request().decode(input)?),
            WireType::CommandRequest => Request::Command(self.command_request().decode(input)?),
            WireType::QueryRequest => Request::Query(self.query_request().decode(input)?),
            WireType::UnregisterRequest => Request::Unregister(self.unregister_request().decode(input)?),
            other => return Err(CodecError::UnknownType(other.tag())),
        };
        Ok(request)
    }

    fn decode_response_body<I: BufferInput + ?Sized>(
        &self,
        wire_type: WireType,
        input: &mut I,
    ) -> Result<Response, CodecError> {
        let response = match wire_type {
            WireType::RegisterResponse => Response::Register(self.register_response().decode(input)?),
            WireType::KeepAliveResponse => Response::KeepAlive(self.keep_alive_response().decode(input)?),
            WireType::CommandResponse => Response::Command(self.command_response().decode(input)?),
            WireType::QueryResponse => Response::Query(self.query_response().decode(input)?),
            WireType::UnregisterResponse => {
                Response::Unregister(self.unregister_response().decode(input)?)
            }
            other => return Err(CodecError::UnknownType(other.tag())),
        };
        Ok(response)
    }
}

impl Default for MessagePools {
    fn default() -> Self {
        MessagePools::new(DEFAULT_POOL_CAPACITY)
    }
}

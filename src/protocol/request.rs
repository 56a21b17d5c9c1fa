//! Client request messages and their builders.
//!
//! Every request has private fields, read-only accessors and a builder that
//! is the only writer. Builders validate each value as it is set and then
//! check required fields once more in `build()`.

use super::buffer::{BufferInput, BufferOutput};
use super::error::{BuildError, CodecError};
use super::pool::{Poolable, Pooled};
use super::types::{
    check_counter, check_member, check_payload, check_positive, from_wire, ConnectionId,
    Consistency, MemberId, SessionId, WireType,
};

// =============================================================================
// SHARED CONTRACTS
// =============================================================================

/// How a request identifies the session it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRef {
    /// A registered session.
    Session(SessionId),
    /// A connection token, used before a session exists.
    Connection(ConnectionId),
}

/// A message with a fixed wire tag and a deterministic payload layout.
pub trait WireMessage: Poolable {
    const WIRE_TYPE: WireType;

    fn wire_type(&self) -> WireType {
        Self::WIRE_TYPE
    }

    /// Write the payload fields (without the type tag) in declared order.
    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B);
}

/// Contract shared by every client request.
pub trait ClientRequest: WireMessage {
    /// The session (or pre-session connection) this request belongs to.
    fn session_ref(&self) -> SessionRef;
}

// =============================================================================
// REGISTER
// =============================================================================

/// Establishes a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRequest {
    member: MemberId,
    connection: ConnectionId,
}

impl RegisterRequest {
    /// Preferred routing target for the session.
    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl Poolable for RegisterRequest {
    fn reset(&mut self) {
        self.member = 0;
        self.connection = ConnectionId::default();
    }
}

impl WireMessage for RegisterRequest {
    const WIRE_TYPE: WireType = WireType::RegisterRequest;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_i32(self.member);
        out.write_token(self.connection.as_bytes());
    }
}

impl ClientRequest for RegisterRequest {
    fn session_ref(&self) -> SessionRef {
        SessionRef::Connection(self.connection)
    }
}

/// Builder for [`RegisterRequest`].
#[derive(Debug)]
pub struct RegisterRequestBuilder {
    request: Pooled<RegisterRequest>,
    member_set: bool,
    connection_set: bool,
}

impl RegisterRequestBuilder {
    pub(crate) fn new(request: Pooled<RegisterRequest>) -> Self {
        RegisterRequestBuilder {
            request,
            member_set: false,
            connection_set: false,
        }
    }

    pub(crate) fn copy_of(mut request: Pooled<RegisterRequest>, existing: &RegisterRequest) -> Self {
        request.get_mut().clone_from(existing);
        RegisterRequestBuilder {
            request,
            member_set: true,
            connection_set: true,
        }
    }

    pub fn with_member(mut self, member: MemberId) -> Result<Self, BuildError> {
        self.request.get_mut().member = check_member("member", member)?;
        self.member_set = true;
        Ok(self)
    }

    pub fn with_connection(mut self, connection: ConnectionId) -> Result<Self, BuildError> {
        if connection.is_nil() {
            return Err(BuildError::invalid("connection", "cannot be the nil token"));
        }
        self.request.get_mut().connection = connection;
        self.connection_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<RegisterRequest>, BuildError> {
        if !self.member_set {
            return Err(BuildError::missing("member"));
        }
        if !self.connection_set {
            return Err(BuildError::missing("connection"));
        }
        check_member("member", self.request.member)?;
        Ok(self.request)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        self,
        input: &mut I,
    ) -> Result<Pooled<RegisterRequest>, CodecError> {
        let member = input.read_i32("member")?;
        let connection = ConnectionId::from_bytes(input.read_token("connection")?);
        Ok(self.with_member(member)?.with_connection(connection)?.build()?)
    }
}

// =============================================================================
// KEEP ALIVE
// =============================================================================

/// Keeps a session alive and acknowledges command results and events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAliveRequest {
    session_id: SessionId,
    command_sequence: u64,
    event_sequence: u64,
}

impl KeepAliveRequest {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Highest command sequence whose result the client has received.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Highest event sequence the client has received.
    pub fn event_sequence(&self) -> u64 {
        self.event_sequence
    }
}

impl Poolable for KeepAliveRequest {
    fn reset(&mut self) {
        *self = KeepAliveRequest::default();
    }
}

impl WireMessage for KeepAliveRequest {
    const WIRE_TYPE: WireType = WireType::KeepAliveRequest;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_i64(self.session_id.as_u64() as i64);
        out.write_i64(self.command_sequence as i64);
        out.write_i64(self.event_sequence as i64);
    }
}

impl ClientRequest for KeepAliveRequest {
    fn session_ref(&self) -> SessionRef {
        SessionRef::Session(self.session_id)
    }
}

/// Builder for [`KeepAliveRequest`]. Both sequences default to zero.
#[derive(Debug)]
pub struct KeepAliveRequestBuilder {
    request: Pooled<KeepAliveRequest>,
    session_set: bool,
}

impl KeepAliveRequestBuilder {
    pub(crate) fn new(request: Pooled<KeepAliveRequest>) -> Self {
        KeepAliveRequestBuilder {
            request,
            session_set: false,
        }
    }

    pub(crate) fn copy_of(mut request: Pooled<KeepAliveRequest>, existing: &KeepAliveRequest) -> Self {
        request.get_mut().clone_from(existing);
        KeepAliveRequestBuilder {
            request,
            session_set: true,
        }
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Result<Self, BuildError> {
        check_positive("session_id", session_id.as_u64())?;
        self.request.get_mut().session_id = session_id;
        self.session_set = true;
        Ok(self)
    }

    pub fn with_command_sequence(mut self, sequence: u64) -> Result<Self, BuildError> {
        self.request.get_mut().command_sequence = check_counter("command_sequence", sequence)?;
        Ok(self)
    }

    pub fn with_event_sequence(mut self, sequence: u64) -> Result<Self, BuildError> {
        self.request.get_mut().event_sequence = check_counter("event_sequence", sequence)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<KeepAliveRequest>, BuildError> {
        if !self.session_set {
            return Err(BuildError::missing("session_id"));
        }
        Ok(self.request)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        self,
        input: &mut I,
    ) -> Result<Pooled<KeepAliveRequest>, CodecError> {
        let session_id = from_wire("session_id", input.read_i64("session_id")?)?;
        let command_sequence = from_wire("command_sequence", input.read_i64("command_sequence")?)?;
        let event_sequence = from_wire("event_sequence", input.read_i64("event_sequence")?)?;
        Ok(self
            .with_session_id(SessionId::new(session_id))?
            .with_command_sequence(command_sequence)?
            .with_event_sequence(event_sequence)?
            .build()?)
    }
}

// =============================================================================
// COMMAND
// =============================================================================

/// Submits an opaque operation to be applied exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    session_id: SessionId,
    sequence: u64,
    operation: Vec<u8>,
}

impl CommandRequest {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Per-session sequence number. Retries reuse it.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn operation(&self) -> &[u8] {
        &self.operation
    }
}

impl Poolable for CommandRequest {
    fn reset(&mut self) {
        self.session_id = SessionId::default();
        self.sequence = 0;
        self.operation.clear();
    }
}

impl WireMessage for CommandRequest {
    const WIRE_TYPE: WireType = WireType::CommandRequest;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_i64(self.session_id.as_u64() as i64);
        out.write_i64(self.sequence as i64);
        out.write_bytes(&self.operation);
    }
}

impl ClientRequest for CommandRequest {
    fn session_ref(&self) -> SessionRef {
        SessionRef::Session(self.session_id)
    }
}

/// Builder for [`CommandRequest`].
#[derive(Debug)]
pub struct CommandRequestBuilder {
    request: Pooled<CommandRequest>,
    session_set: bool,
    sequence_set: bool,
    operation_set: bool,
}

impl CommandRequestBuilder {
    pub(crate) fn new(request: Pooled<CommandRequest>) -> Self {
        CommandRequestBuilder {
            request,
            session_set: false,
            sequence_set: false,
            operation_set: false,
        }
    }

    pub(crate) fn copy_of(mut request: Pooled<CommandRequest>, existing: &CommandRequest) -> Self {
        request.get_mut().clone_from(existing);
        CommandRequestBuilder {
            request,
            session_set: true,
            sequence_set: true,
            operation_set: true,
        }
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Result<Self, BuildError> {
        check_positive("session_id", session_id.as_u64())?;
        self.request.get_mut().session_id = session_id;
        self.session_set = true;
        Ok(self)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Result<Self, BuildError> {
        self.request.get_mut().sequence = check_positive("sequence", sequence)?;
        self.sequence_set = true;
        Ok(self)
    }

    /// Copy the operation into the pooled buffer. An empty operation is allowed.
    pub fn with_operation(mut self, operation: &[u8]) -> Result<Self, BuildError> {
        check_payload("operation", operation.len())?;
        let buf = &mut self.request.get_mut().operation;
        buf.clear();
        buf.extend_from_slice(operation);
        self.operation_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<CommandRequest>, BuildError> {
        if !self.session_set {
            return Err(BuildError::missing("session_id"));
        }
        if !self.sequence_set {
            return Err(BuildError::missing("sequence"));
        }
        if !self.operation_set {
            return Err(BuildError::missing("operation"));
        }
        Ok(self.request)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<CommandRequest>, CodecError> {
        let session_id = from_wire("session_id", input.read_i64("session_id")?)?;
        let sequence = from_wire("sequence", input.read_i64("sequence")?)?;
        input.read_bytes_into("operation", &mut self.request.get_mut().operation)?;
        self.operation_set = true;
        Ok(self
            .with_session_id(SessionId::new(session_id))?
            .with_sequence(sequence)?
            .build()?)
    }
}

// =============================================================================
// QUERY
// =============================================================================

/// Reads state without advancing the session's command sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    session_id: SessionId,
    consistency: Consistency,
    query: Vec<u8>,
}

impl QueryRequest {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn query(&self) -> &[u8] {
        &self.query
    }
}

impl Poolable for QueryRequest {
    fn reset(&mut self) {
        self.session_id = SessionId::default();
        self.consistency = Consistency::default();
        self.query.clear();
    }
}

impl WireMessage for QueryRequest {
    const WIRE_TYPE: WireType = WireType::QueryRequest;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_i64(self.session_id.as_u64() as i64);
        out.write_u8(self.consistency.as_u8());
        out.write_bytes(&self.query);
    }
}

impl ClientRequest for QueryRequest {
    fn session_ref(&self) -> SessionRef {
        SessionRef::Session(self.session_id)
    }
}

/// Builder for [`QueryRequest`]. Consistency defaults to sequential.
#[derive(Debug)]
pub struct QueryRequestBuilder {
    request: Pooled<QueryRequest>,
    session_set: bool,
    query_set: bool,
}

impl QueryRequestBuilder {
    pub(crate) fn new(request: Pooled<QueryRequest>) -> Self {
        QueryRequestBuilder {
            request,
            session_set: false,
            query_set: false,
        }
    }

    pub(crate) fn copy_of(mut request: Pooled<QueryRequest>, existing: &QueryRequest) -> Self {
        request.get_mut().clone_from(existing);
        QueryRequestBuilder {
            request,
            session_set: true,
            query_set: true,
        }
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Result<Self, BuildError> {
        check_positive("session_id", session_id.as_u64())?;
        self.request.get_mut().session_id = session_id;
        self.session_set = true;
        Ok(self)
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.request.get_mut().consistency = consistency;
        self
    }

    pub fn with_query(mut self, query: &[u8]) -> Result<Self, BuildError> {
        check_payload("query", query.len())?;
        let buf = &mut self.request.get_mut().query;
        buf.clear();
        buf.extend_from_slice(query);
        self.query_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<QueryRequest>, BuildError> {
        if !self.session_set {
            return Err(BuildError::missing("session_id"));
        }
        if !self.query_set {
            return Err(BuildError::missing("query"));
        }
        Ok(self.request)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<QueryRequest>, CodecError> {
        let session_id = from_wire("session_id", input.read_i64("session_id")?)?;
        let consistency = Consistency::from_u8(input.read_u8("consistency")?)?;
        input.read_bytes_into("query", &mut self.request.get_mut().query)?;
        self.query_set = true;
        Ok(self
            .with_session_id(SessionId::new(session_id))?
            .with_consistency(consistency)
            .build()?)
    }
}

// =============================================================================
// UNREGISTER
// =============================================================================

/// Explicitly closes a session. Closing an unknown or closed session succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnregisterRequest {
    session_id: SessionId,
}

impl UnregisterRequest {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Poolable for UnregisterRequest {
    fn reset(&mut self) {
        self.session_id = SessionId::default();
    }
}

impl WireMessage for UnregisterRequest {
    const WIRE_TYPE: WireType = WireType::UnregisterRequest;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_i64(self.session_id.as_u64() as i64);
    }
}

impl ClientRequest for UnregisterRequest {
    fn session_ref(&self) -> SessionRef {
        SessionRef::Session(self.session_id)
    }
}

/// Builder for [`UnregisterRequest`].
#[derive(Debug)]
pub struct UnregisterRequestBuilder {
    request: Pooled<UnregisterRequest>,
    session_set: bool,
}

impl UnregisterRequestBuilder {
    pub(crate) fn new(request: Pooled<UnregisterRequest>) -> Self {
        UnregisterRequestBuilder {
            request,
            session_set: false,
        }
    }

    pub(crate) fn copy_of(mut request: Pooled<UnregisterRequest>, existing: &UnregisterRequest) -> Self {
        request.get_mut().clone_from(existing);
        UnregisterRequestBuilder {
            request,
            session_set: true,
        }
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Result<Self, BuildError> {
        check_positive("session_id", session_id.as_u64())?;
        self.request.get_mut().session_id = session_id;
        self.session_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<UnregisterRequest>, BuildError> {
        if !self.session_set {
            return Err(BuildError::missing("session_id"));
        }
        Ok(self.request)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        self,
        input: &mut I,
    ) -> Result<Pooled<UnregisterRequest>, CodecError> {
        let session_id = from_wire("session_id", input.read_i64("session_id")?)?;
        Ok(self.with_session_id(SessionId::new(session_id))?.build()?)
    }
}

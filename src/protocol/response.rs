//! Cluster response messages and their builders.
//!
//! Every response starts with a status byte. A successful response is
//! followed by its type-specific fields; any other status is followed by the
//! shared error body: `leader:i32 (-1 = unknown)` and an optional message.

use super::buffer::{BufferInput, BufferOutput};
use super::error::{BuildError, CodecError, Status};
use super::pool::{Poolable, Pooled};
use super::request::WireMessage;
use super::types::{
    check_member, check_payload, check_positive, check_timeout, from_wire, leader_from_wire,
    leader_to_wire, MemberId, SessionId, WireType,
};

/// Contract shared by every response.
pub trait ClientResponse: WireMessage {
    fn status(&self) -> Status;

    /// Current leader, if the responding member knows it.
    fn leader(&self) -> Option<MemberId>;

    /// Human-readable detail attached to an error status.
    fn error_message(&self) -> Option<&str>;

    fn is_ok(&self) -> bool {
        self.status().is_ok()
    }
}

// =============================================================================
// RESPONSE HEADER
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ResponseHeader {
    status: Status,
    leader: Option<MemberId>,
    message: Option<String>,
}

impl ResponseHeader {
    fn reset(&mut self) {
        self.status = Status::Ok;
        self.leader = None;
        self.message = None;
    }

    fn set_error(&mut self, status: Status, message: Option<&str>) -> Result<(), BuildError> {
        if status.is_ok() {
            return Err(BuildError::invalid("status", "an error response needs a non-OK status"));
        }
        if let Some(message) = message {
            check_payload("message", message.len())?;
        }
        self.status = status;
        self.message = message.map(str::to_owned);
        Ok(())
    }

    fn set_leader(&mut self, leader: MemberId) -> Result<(), BuildError> {
        self.leader = Some(check_member("leader", leader)?);
        Ok(())
    }

    /// Error bodies carry only the leader hint and the message.
    fn check_error_body(&self, field: &'static str, set: bool) -> Result<(), BuildError> {
        if set && !self.status.is_ok() {
            return Err(BuildError::invalid(field, "an error response carries no body fields"));
        }
        Ok(())
    }

    /// For message types whose OK body has no leader field.
    fn check_ok_without_leader(&self) -> Result<(), BuildError> {
        if self.status.is_ok() && self.leader.is_some() {
            return Err(BuildError::invalid("leader", "only carried by OK register and keep-alive responses"));
        }
        Ok(())
    }

    fn encode_error<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_i32(leader_to_wire(self.leader));
        out.write_optional_string(self.message.as_deref());
    }

    /// Reads the error body into the header. The status byte was already read.
    fn decode_error<I: BufferInput + ?Sized>(
        &mut self,
        status: Status,
        input: &mut I,
    ) -> Result<(), CodecError> {
        self.leader = leader_from_wire(input.read_i32("leader")?)?;
        let message = input.read_optional_string("message")?;
        self.set_error(status, message.as_deref())?;
        Ok(())
    }
}

macro_rules! response_contract {
    ($ty:ty) => {
        impl ClientResponse for $ty {
            fn status(&self) -> Status {
                self.header.status
            }

            fn leader(&self) -> Option<MemberId> {
                self.header.leader
            }

            fn error_message(&self) -> Option<&str> {
                self.header.message.as_deref()
            }
        }
    };
}

// =============================================================================
// REGISTER
// =============================================================================

/// Result of a committed registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterResponse {
    header: ResponseHeader,
    session_id: SessionId,
    timeout_ms: u64,
}

impl RegisterResponse {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Negotiated inactivity bound for the new session.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }
}

impl Poolable for RegisterResponse {
    fn reset(&mut self) {
        self.header.reset();
        self.session_id = SessionId::default();
        self.timeout_ms = 0;
    }
}

impl WireMessage for RegisterResponse {
    const WIRE_TYPE: WireType = WireType::RegisterResponse;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_u8(self.header.status.as_u8());
        if self.header.status.is_ok() {
            out.write_i64(self.session_id.as_u64() as i64);
            out.write_i32(leader_to_wire(self.header.leader));
            out.write_i64(self.timeout_ms as i64);
        } else {
            self.header.encode_error(out);
        }
    }
}

response_contract!(RegisterResponse);

/// Builder for [`RegisterResponse`].
#[derive(Debug)]
pub struct RegisterResponseBuilder {
    response: Pooled<RegisterResponse>,
    session_set: bool,
    timeout_set: bool,
}

impl RegisterResponseBuilder {
    pub(crate) fn new(response: Pooled<RegisterResponse>) -> Self {
        RegisterResponseBuilder {
            response,
            session_set: false,
            timeout_set: false,
        }
    }

    pub(crate) fn copy_of(mut response: Pooled<RegisterResponse>, existing: &RegisterResponse) -> Self {
        response.get_mut().clone_from(existing);
        let ok = existing.header.status.is_ok();
        RegisterResponseBuilder {
            response,
            session_set: ok,
            timeout_set: ok,
        }
    }

    pub fn with_error(mut self, status: Status, message: Option<&str>) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_error(status, message)?;
        Ok(self)
    }

    pub fn with_leader(mut self, leader: MemberId) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_leader(leader)?;
        Ok(self)
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Result<Self, BuildError> {
        check_positive("session_id", session_id.as_u64())?;
        self.response.get_mut().session_id = session_id;
        self.session_set = true;
        Ok(self)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Result<Self, BuildError> {
        self.response.get_mut().timeout_ms = check_timeout("timeout_ms", timeout_ms)?;
        self.timeout_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<RegisterResponse>, BuildError> {
        let header = &self.response.header;
        header.check_error_body("session_id", self.session_set)?;
        header.check_error_body("timeout_ms", self.timeout_set)?;
        if header.status.is_ok() {
            if !self.session_set {
                return Err(BuildError::missing("session_id"));
            }
            if self.response.header.leader.is_none() {
                return Err(BuildError::missing("leader"));
            }
            if !self.timeout_set {
                return Err(BuildError::missing("timeout_ms"));
            }
        }
        Ok(self.response)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<RegisterResponse>, CodecError> {
        let status = Status::from_u8(input.read_u8("status")?)?;
        if !status.is_ok() {
            self.response.get_mut().header.decode_error(status, input)?;
            return Ok(self.build()?);
        }
        let session_id = from_wire("session_id", input.read_i64("session_id")?)?;
        let leader = input.read_i32("leader")?;
        let timeout_ms = from_wire("timeout_ms", input.read_i64("timeout_ms")?)?;
        Ok(self
            .with_session_id(SessionId::new(session_id))?
            .with_leader(leader)?
            .with_timeout_ms(timeout_ms)?
            .build()?)
    }
}

// =============================================================================
// KEEP ALIVE
// =============================================================================

/// Confirms a session is alive, or reports why it is not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAliveResponse {
    header: ResponseHeader,
}

impl Poolable for KeepAliveResponse {
    fn reset(&mut self) {
        self.header.reset();
    }
}

impl WireMessage for KeepAliveResponse {
    const WIRE_TYPE: WireType = WireType::KeepAliveResponse;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_u8(self.header.status.as_u8());
        if self.header.status.is_ok() {
            out.write_i32(leader_to_wire(self.header.leader));
        } else {
            self.header.encode_error(out);
        }
    }
}

response_contract!(KeepAliveResponse);

/// Builder for [`KeepAliveResponse`].
#[derive(Debug)]
pub struct KeepAliveResponseBuilder {
    response: Pooled<KeepAliveResponse>,
}

impl KeepAliveResponseBuilder {
    pub(crate) fn new(response: Pooled<KeepAliveResponse>) -> Self {
        KeepAliveResponseBuilder { response }
    }

    pub(crate) fn copy_of(mut response: Pooled<KeepAliveResponse>, existing: &KeepAliveResponse) -> Self {
        response.get_mut().clone_from(existing);
        KeepAliveResponseBuilder { response }
    }

    pub fn with_error(mut self, status: Status, message: Option<&str>) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_error(status, message)?;
        Ok(self)
    }

    pub fn with_leader(mut self, leader: MemberId) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_leader(leader)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<KeepAliveResponse>, BuildError> {
        Ok(self.response)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<KeepAliveResponse>, CodecError> {
        let status = Status::from_u8(input.read_u8("status")?)?;
        let header = &mut self.response.get_mut().header;
        if status.is_ok() {
            header.leader = leader_from_wire(input.read_i32("leader")?)?;
        } else {
            header.decode_error(status, input)?;
        }
        Ok(self.build()?)
    }
}

// =============================================================================
// COMMAND
// =============================================================================

/// Result of an applied (or previously applied) command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    header: ResponseHeader,
    sequence: u64,
    result: Vec<u8>,
}

impl CommandResponse {
    /// Sequence number of the command this result belongs to.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn result(&self) -> &[u8] {
        &self.result
    }
}

impl Poolable for CommandResponse {
    fn reset(&mut self) {
        self.header.reset();
        self.sequence = 0;
        self.result.clear();
    }
}

impl WireMessage for CommandResponse {
    const WIRE_TYPE: WireType = WireType::CommandResponse;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_u8(self.header.status.as_u8());
        if self.header.status.is_ok() {
            out.write_i64(self.sequence as i64);
            out.write_bytes(&self.result);
        } else {
            self.header.encode_error(out);
        }
    }
}

response_contract!(CommandResponse);

/// Builder for [`CommandResponse`].
#[derive(Debug)]
pub struct CommandResponseBuilder {
    response: Pooled<CommandResponse>,
    sequence_set: bool,
    result_set: bool,
}

impl CommandResponseBuilder {
    pub(crate) fn new(response: Pooled<CommandResponse>) -> Self {
        CommandResponseBuilder {
            response,
            sequence_set: false,
            result_set: false,
        }
    }

    pub(crate) fn copy_of(mut response: Pooled<CommandResponse>, existing: &CommandResponse) -> Self {
        response.get_mut().clone_from(existing);
        let ok = existing.header.status.is_ok();
        CommandResponseBuilder {
            response,
            sequence_set: ok,
            result_set: ok,
        }
    }

    pub fn with_error(mut self, status: Status, message: Option<&str>) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_error(status, message)?;
        Ok(self)
    }

    pub fn with_leader(mut self, leader: MemberId) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_leader(leader)?;
        Ok(self)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Result<Self, BuildError> {
        self.response.get_mut().sequence = check_positive("sequence", sequence)?;
        self.sequence_set = true;
        Ok(self)
    }

    pub fn with_result(mut self, result: &[u8]) -> Result<Self, BuildError> {
        check_payload("result", result.len())?;
        let buf = &mut self.response.get_mut().result;
        buf.clear();
        buf.extend_from_slice(result);
        self.result_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<CommandResponse>, BuildError> {
        let header = &self.response.header;
        header.check_error_body("sequence", self.sequence_set)?;
        header.check_error_body("result", self.result_set)?;
        header.check_ok_without_leader()?;
        if header.status.is_ok() {
            if !self.sequence_set {
                return Err(BuildError::missing("sequence"));
            }
            if !self.result_set {
                return Err(BuildError::missing("result"));
            }
        }
        Ok(self.response)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<CommandResponse>, CodecError> {
        let status = Status::from_u8(input.read_u8("status")?)?;
        if !status.is_ok() {
            self.response.get_mut().header.decode_error(status, input)?;
            return Ok(self.build()?);
        }
        let sequence = from_wire("sequence", input.read_i64("sequence")?)?;
        input.read_bytes_into("result", &mut self.response.get_mut().result)?;
        self.result_set = true;
        Ok(self.with_sequence(sequence)?.build()?)
    }
}

// =============================================================================
// QUERY
// =============================================================================

/// Result of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResponse {
    header: ResponseHeader,
    result: Vec<u8>,
}

impl QueryResponse {
    pub fn result(&self) -> &[u8] {
        &self.result
    }
}

impl Poolable for QueryResponse {
    fn reset(&mut self) {
        self.header.reset();
        self.result.clear();
    }
}

impl WireMessage for QueryResponse {
    const WIRE_TYPE: WireType = WireType::QueryResponse;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_u8(self.header.status.as_u8());
        if self.header.status.is_ok() {
            out.write_bytes(&self.result);
        } else {
            self.header.encode_error(out);
        }
    }
}

response_contract!(QueryResponse);

/// Builder for [`QueryResponse`].
#[derive(Debug)]
pub struct QueryResponseBuilder {
    response: Pooled<QueryResponse>,
    result_set: bool,
}

impl QueryResponseBuilder {
    pub(crate) fn new(response: Pooled<QueryResponse>) -> Self {
        QueryResponseBuilder {
            response,
            result_set: false,
        }
    }

    pub(crate) fn copy_of(mut response: Pooled<QueryResponse>, existing: &QueryResponse) -> Self {
        response.get_mut().clone_from(existing);
        let ok = existing.header.status.is_ok();
        QueryResponseBuilder {
            response,
            result_set: ok,
        }
    }

    pub fn with_error(mut self, status: Status, message: Option<&str>) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_error(status, message)?;
        Ok(self)
    }

    pub fn with_leader(mut self, leader: MemberId) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_leader(leader)?;
        Ok(self)
    }

    pub fn with_result(mut self, result: &[u8]) -> Result<Self, BuildError> {
        check_payload("result", result.len())?;
        let buf = &mut self.response.get_mut().result;
        buf.clear();
        buf.extend_from_slice(result);
        self.result_set = true;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<QueryResponse>, BuildError> {
        let header = &self.response.header;
        header.check_error_body("result", self.result_set)?;
        header.check_ok_without_leader()?;
        if header.status.is_ok() && !self.result_set {
            return Err(BuildError::missing("result"));
        }
        Ok(self.response)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<QueryResponse>, CodecError> {
        let status = Status::from_u8(input.read_u8("status")?)?;
        if status.is_ok() {
            input.read_bytes_into("result", &mut self.response.get_mut().result)?;
            self.result_set = true;
        } else {
            self.response.get_mut().header.decode_error(status, input)?;
        }
        Ok(self.build()?)
    }
}

// =============================================================================
// UNREGISTER
// =============================================================================

/// Acknowledges a session close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnregisterResponse {
    header: ResponseHeader,
}

impl Poolable for UnregisterResponse {
    fn reset(&mut self) {
        self.header.reset();
    }
}

impl WireMessage for UnregisterResponse {
    const WIRE_TYPE: WireType = WireType::UnregisterResponse;

    fn encode_payload<B: BufferOutput + ?Sized>(&self, out: &mut B) {
        out.write_u8(self.header.status.as_u8());
        if !self.header.status.is_ok() {
            self.header.encode_error(out);
        }
    }
}

response_contract!(UnregisterResponse);

/// Builder for [`UnregisterResponse`].
#[derive(Debug)]
pub struct UnregisterResponseBuilder {
    response: Pooled<UnregisterResponse>,
}

impl UnregisterResponseBuilder {
    pub(crate) fn new(response: Pooled<UnregisterResponse>) -> Self {
        UnregisterResponseBuilder { response }
    }

    pub(crate) fn copy_of(
        mut response: Pooled<UnregisterResponse>,
        existing: &UnregisterResponse,
    ) -> Self {
        response.get_mut().clone_from(existing);
        UnregisterResponseBuilder { response }
    }

    pub fn with_error(mut self, status: Status, message: Option<&str>) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_error(status, message)?;
        Ok(self)
    }

    pub fn with_leader(mut self, leader: MemberId) -> Result<Self, BuildError> {
        self.response.get_mut().header.set_leader(leader)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Pooled<UnregisterResponse>, BuildError> {
        self.response.header.check_ok_without_leader()?;
        Ok(self.response)
    }

    pub(crate) fn decode<I: BufferInput + ?Sized>(
        mut self,
        input: &mut I,
    ) -> Result<Pooled<UnregisterResponse>, CodecError> {
        let status = Status::from_u8(input.read_u8("status")?)?;
        if !status.is_ok() {
            self.response.get_mut().header.decode_error(status, input)?;
        }
        Ok(self.build()?)
    }
}

//! Client transport seam and an in-process implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::protocol::{CodecError, MemberId};

/// Request/response exchange with one cluster member.
///
/// Connection handling, framing and TLS belong to the implementation.
pub trait Transport: Send + Sync {
    fn send(&self, member: MemberId, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No reply in time. The request may or may not have been processed.
    #[error("member {member} did not reply in time")]
    Timeout { member: MemberId },

    #[error("member {member} is unreachable")]
    Unreachable { member: MemberId },

    /// The member refused a malformed request and dropped the connection.
    #[error("member {member} closed the connection")]
    Closed { member: MemberId },
}

/// Server side of an in-process exchange.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, request: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Routes requests to in-process handlers, with fault injection.
#[derive(Default)]
pub struct LocalTransport {
    endpoints: RwLock<HashMap<MemberId, Arc<dyn RequestHandler>>>,
    down: Mutex<HashSet<MemberId>>,
    /// Per member: replies to discard after the request was handled.
    drop_replies: Mutex<HashMap<MemberId, u32>>,
    sent: AtomicU64,
}

impl LocalTransport {
    pub fn new() -> Self {
        LocalTransport::default()
    }

    pub fn connect(&self, member: MemberId, handler: Arc<dyn RequestHandler>) {
        self.endpoints.write().insert(member, handler);
    }

    /// Make `member` unreachable (`true`) or reachable again (`false`).
    pub fn set_down(&self, member: MemberId, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(member);
        } else {
            set.remove(&member);
        }
    }

    /// Let `member` process the next `count` requests but lose their replies.
    pub fn drop_replies(&self, member: MemberId, count: u32) {
        *self.drop_replies.lock().entry(member).or_insert(0) += count;
    }

    /// Requests sent so far, including ones that failed.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for LocalTransport {
    fn send(&self, member: MemberId, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if self.down.lock().contains(&member) {
            return Err(TransportError::Unreachable { member });
        }
        let handler = self
            .endpoints
            .read()
            .get(&member)
            .cloned()
            .ok_or(TransportError::Unreachable { member })?;

        let reply = handler
            .handle_request(request)
            .map_err(|_| TransportError::Closed { member })?;

        let mut drops = self.drop_replies.lock();
        if let Some(remaining) = drops.get_mut(&member) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Timeout { member });
            }
        }
        Ok(reply)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, member: MemberId, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).send(member, request, timeout)
    }
}

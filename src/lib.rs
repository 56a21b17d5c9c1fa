//! Client sessions for a replicated state machine.
//!
//! Clients open a session with the cluster, then submit commands tagged with
//! a per-session sequence number. The cluster replicates session entries
//! through its consensus log and applies them to a [`session::SessionStateMachine`]
//! on every member, which caches results so a resent command is answered
//! instead of applied twice.
//!
//! - [`protocol`]: pooled request/response messages and their binary codec
//! - [`session`]: replicated session state, applied from committed entries
//! - [`server`]: request handling on a cluster member, expiry timer
//! - [`client`]: session driver with redirect and retry
//! - [`kv`]: reference application

pub mod client;
pub mod clock;
pub mod config;
pub mod kv;
pub mod protocol;
pub mod server;
pub mod session;

//! Leader-side expiry timer.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::debug;

use super::{ConsensusCore, SessionServer};
use crate::session::Application;

/// Periodically asks a [`SessionServer`] to propose expiries.
///
/// The timer never changes session state itself; it only proposes entries,
/// and does nothing while its member is not the leader. Dropping the timer
/// stops the thread.
pub struct ExpiryTimer {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpiryTimer {
    pub fn start<A, C>(server: Arc<SessionServer<A, C>>, interval: Duration) -> std::io::Result<Self>
    where
        A: Application + 'static,
        C: ConsensusCore + 'static,
    {
        let (shutdown, stop) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("expiry-{}", server.member_id()))
            .spawn(move || loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let proposed = server.propose_expirations();
                        if proposed > 0 {
                            debug!(member = server.member_id(), proposed, "expiry tick");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(ExpiryTimer {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the timer and wait for its thread.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

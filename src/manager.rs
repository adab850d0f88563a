//! Link manager for concurrent controller sessions.
//!
//! Owns a bounded set of sessions over one shared transport. Each session is
//! an independent state machine; the manager only enforces the slot budget
//! and provides collective shutdown.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ble::transport::CentralTransport;
use crate::error::{Error, Result};
use crate::session::{ControllerSession, SessionConfig};

/// Maximum number of concurrent links.
///
/// Matches the central connection budget of the reference radio stack.
pub const MAX_LINKS: usize = 3;

/// Manages up to [`MAX_LINKS`] concurrent controller sessions.
pub struct LinkManager {
    /// Shared transport all sessions run over.
    transport: Arc<dyn CentralTransport>,
    /// Active sessions.
    sessions: RwLock<Vec<Arc<ControllerSession>>>,
}

impl LinkManager {
    /// Create a new manager over the given transport.
    pub fn new(transport: Arc<dyn CentralTransport>) -> Self {
        Self {
            transport,
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Start a new session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxLinksReached`] when all slots are taken by
    /// running sessions. This is the only resource refusal this crate
    /// surfaces; everything else is handled inside the sessions.
    pub fn start_session(&self, config: SessionConfig) -> Result<Arc<ControllerSession>> {
        let mut sessions = self.sessions.write();

        // Sessions that gave up or were stopped free their slot.
        sessions.retain(|s| s.is_running());

        if sessions.len() >= MAX_LINKS {
            return Err(Error::MaxLinksReached { max: MAX_LINKS });
        }

        let session = Arc::new(ControllerSession::new(self.transport.clone(), config));
        session.start();

        debug!("Started session {}/{}", sessions.len() + 1, MAX_LINKS);

        sessions.push(session.clone());
        Ok(session)
    }

    /// Get all managed sessions, including ones that have since stopped.
    pub fn sessions(&self) -> Vec<Arc<ControllerSession>> {
        self.sessions.read().clone()
    }

    /// Number of currently running sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.read().iter().filter(|s| s.is_running()).count()
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        info!("Shutting down link manager");

        let sessions: Vec<_> = self.sessions.write().drain(..).collect();
        for session in sessions {
            session.stop().await;
        }
    }
}

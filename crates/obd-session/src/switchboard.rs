//! Exclusive link ownership
//!
//! The sessions themselves only offer suspend/resume; this is the one
//! place that upholds "at most one session un-suspended".

use crate::error::SessionError;
use crate::session::{ManagedSession, SessionKind};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct Switchboard {
    sessions: Vec<Arc<dyn ManagedSession>>,
    active: Mutex<Option<SessionKind>>,
}

impl Switchboard {
    pub fn new(sessions: Vec<Arc<dyn ManagedSession>>) -> Self {
        Self {
            sessions,
            active: Mutex::new(None),
        }
    }

    pub fn session(&self, kind: SessionKind) -> Option<&Arc<dyn ManagedSession>> {
        self.sessions.iter().find(|s| s.kind() == kind)
    }

    pub async fn active(&self) -> Option<SessionKind> {
        *self.active.lock().await
    }

    /// Suspend every other session, then resume `kind`.
    pub async fn switch_to(&self, kind: SessionKind) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        let target = self
            .session(kind)
            .ok_or(SessionError::UnknownSession(kind))?;
        if *active == Some(kind) && !target.is_suspended() {
            return Ok(());
        }
        for session in self.sessions.iter().filter(|s| s.kind() != kind) {
            if !session.is_suspended() {
                session.suspend(true).await;
            }
        }
        target.resume();
        info!(from = ?*active, to = %kind, "Link handed over");
        *active = Some(kind);
        Ok(())
    }

    /// Suspend whichever session is active
    pub async fn suspend_all(&self) {
        let mut active = self.active.lock().await;
        for session in &self.sessions {
            if !session.is_suspended() {
                session.suspend(true).await;
            }
        }
        *active = None;
    }

    /// Shut every session down. Idempotent.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for session in &self.sessions {
            session.shutdown().await;
        }
        *active = None;
    }

    /// Number of sessions currently un-suspended
    pub fn unsuspended(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_suspended()).count()
    }
}

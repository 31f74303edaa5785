//! Agent session records and registry

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Lifecycle status of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSessionStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

/// One agent query's lifecycle record. Kept for the lifetime of the process
/// so status queries keep working after the stream ends.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub session_id: String,
    pub user_id: String,
    pub container_id: String,
    pub command: String,
    pub status: AgentSessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-provider session registry.
///
/// Guards its own map; enforces at most one `running` session per id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, AgentSession>,
    cancels: DashMap<String, CancellationToken>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running session. Fails when a session with the same id
    /// is still running; finished records are replaced.
    pub fn begin(
        &self,
        session_id: &str,
        user_id: &str,
        container_id: &str,
        command: &str,
    ) -> Option<CancellationToken> {
        if self.is_active(session_id) {
            return None;
        }

        let session = AgentSession {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            container_id: container_id.to_string(),
            command: command.to_string(),
            status: AgentSessionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        };

        let token = CancellationToken::new();
        self.sessions.insert(session_id.to_string(), session);
        self.cancels.insert(session_id.to_string(), token.clone());
        Some(token)
    }

    /// Transition a running session into a terminal state
    pub fn finish(&self, session_id: &str, status: AgentSessionStatus, error: Option<String>) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if session.status == AgentSessionStatus::Running {
                session.status = status;
                session.end_time = Some(Utc::now());
                session.error = error;
            }
        }
        self.cancels.remove(session_id);
    }

    /// Abort a running session: the record flips immediately, the stream is
    /// interrupted fire-and-forget via the cancellation token.
    ///
    /// Returns false for unknown or already-finished sessions.
    pub fn abort(&self, session_id: &str) -> bool {
        let aborted = match self.sessions.get_mut(session_id) {
            Some(mut session) if session.status == AgentSessionStatus::Running => {
                session.status = AgentSessionStatus::Aborted;
                session.end_time = Some(Utc::now());
                true
            }
            _ => false,
        };

        if aborted {
            if let Some((_, token)) = self.cancels.remove(session_id) {
                token.cancel();
            }
        }

        aborted
    }

    /// Active means status == running
    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.status == AgentSessionStatus::Running)
            .unwrap_or(false)
    }

    pub fn get(&self, session_id: &str) -> Option<AgentSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn list_active(&self) -> Vec<AgentSession> {
        self.sessions
            .iter()
            .filter(|s| s.status == AgentSessionStatus::Running)
            .map(|s| s.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_running(id: &str) -> SessionRegistry {
        let registry = SessionRegistry::new();
        registry.begin(id, "7", "c1", "echo hi").unwrap();
        registry
    }

    #[test]
    fn test_begin_rejects_duplicate_running_session() {
        let registry = registry_with_running("a1");
        assert!(registry.begin("a1", "7", "c1", "echo again").is_none());
    }

    #[test]
    fn test_begin_replaces_finished_session() {
        let registry = registry_with_running("a1");
        registry.finish("a1", AgentSessionStatus::Completed, None);

        assert!(registry.begin("a1", "7", "c1", "echo again").is_some());
        assert!(registry.is_active("a1"));
    }

    #[test]
    fn test_abort_is_terminal() {
        let registry = registry_with_running("a1");

        assert!(registry.abort("a1"));
        assert!(!registry.is_active("a1"));
        assert_eq!(
            registry.get("a1").unwrap().status,
            AgentSessionStatus::Aborted
        );

        // A second abort reports failure
        assert!(!registry.abort("a1"));
    }

    #[test]
    fn test_abort_unknown_session_is_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.abort("missing"));
    }

    #[test]
    fn test_abort_cancels_token() {
        let registry = SessionRegistry::new();
        let token = registry.begin("a1", "7", "c1", "cmd").unwrap();

        registry.abort("a1");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_finish_does_not_overwrite_abort() {
        let registry = registry_with_running("a1");
        registry.abort("a1");

        // Stream teardown races the abort; the abort wins
        registry.finish("a1", AgentSessionStatus::Completed, None);
        assert_eq!(
            registry.get("a1").unwrap().status,
            AgentSessionStatus::Aborted
        );
    }

    #[test]
    fn test_list_active_filters_finished() {
        let registry = SessionRegistry::new();
        registry.begin("a1", "7", "c1", "one").unwrap();
        registry.begin("a2", "7", "c1", "two").unwrap();
        registry.finish("a1", AgentSessionStatus::Error, Some("boom".into()));

        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "a2");
    }
}

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::Session;
use crate::backend::GenerationBackend;
use crate::error::Result;
use crate::poller::PollPolicy;

/// Open sessions, one per project name.
pub struct SessionManager {
    backend: Arc<dyn GenerationBackend>,
    policy: PollPolicy,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn GenerationBackend>, policy: PollPolicy) -> Self {
        SessionManager {
            backend,
            policy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Load `project` fresh. Any session already open for it is closed, so its
    /// pending completions are dropped.
    pub async fn open(&self, project: &str) -> Result<Arc<Session>> {
        let session = Session::open(project, self.backend.clone(), self.policy.clone()).await?;

        let previous = self
            .sessions
            .write()
            .insert(project.to_string(), session.clone());
        if let Some(previous) = previous {
            previous.close();
        }

        info!("[Sessions] Opened session {} for {}", session.id(), session.project());
        Ok(session)
    }

    pub fn get(&self, project: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(project).cloned()
    }

    /// Returns false when nothing was open for `project`.
    pub fn close(&self, project: &str) -> bool {
        match self.sessions.write().remove(project) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}

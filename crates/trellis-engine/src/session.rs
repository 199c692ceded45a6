use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::MutexGuard;
use tracing::debug;

use trellis_core::config::ThreadConfig;
use trellis_core::error::Result;

use crate::checkpoint::HierarchyStore;
use crate::thread::{ThreadHierarchy, ThreadLimits};

/// One agent's session: its thread hierarchy behind a per-agent lock.
///
/// A run holds the lock for its whole duration, so nested sessions of one
/// agent are entered and left by at most one run at a time. Different
/// agents never contend.
pub struct AgentSession {
    agent_id: String,
    hierarchy: tokio::sync::Mutex<ThreadHierarchy>,
}

impl AgentSession {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, ThreadHierarchy> {
        self.hierarchy.lock().await
    }
}

/// Maps agent ids to their sessions, creating (or restoring) on first use.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
    store: Option<HierarchyStore>,
    root_budget: u64,
    limits: ThreadLimits,
}

impl SessionRegistry {
    pub fn new(config: &ThreadConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store: None,
            root_budget: config.root_window_tokens,
            limits: ThreadLimits::from(config),
        }
    }

    /// Persist hierarchies so nested sessions survive restarts.
    pub fn with_store(mut self, store: HierarchyStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&HierarchyStore> {
        self.store.as_ref()
    }

    /// Get or create the session for an agent.
    pub fn session(&self, agent_id: &str) -> Result<Arc<AgentSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get(agent_id) {
            return Ok(Arc::clone(session));
        }

        let restored = match &self.store {
            Some(store) => store.load(agent_id, self.limits)?,
            None => None,
        };
        debug!(agent_id, restored = restored.is_some(), "Created agent session");
        let hierarchy = restored
            .unwrap_or_else(|| ThreadHierarchy::new(agent_id, self.root_budget, self.limits));
        let session = Arc::new(AgentSession {
            agent_id: agent_id.to_string(),
            hierarchy: tokio::sync::Mutex::new(hierarchy),
        });
        sessions.insert(agent_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Write a hierarchy snapshot, if a store is attached.
    pub fn save(&self, hierarchy: &ThreadHierarchy) -> Result<()> {
        match &self.store {
            Some(store) => store.save(hierarchy),
            None => Ok(()),
        }
    }

    /// Agents with a live session, sorted.
    pub fn agents(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<String> = sessions.keys().cloned().collect();
        agents.sort();
        agents
    }
}

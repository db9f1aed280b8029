//! Agent Registry (§4.A).
//!
//! Follows the teacher's repository pattern from `engine::storage`: a trait
//! plus an in-memory implementation behind a `std::sync::RwLock<HashMap>`.
//! Unlike the Checkpoint/Event layers, the registry is read-mostly after
//! startup, so the synchronous `RwLock` (rather than `tokio::sync::RwLock`)
//! is the right tool — no lock is ever held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::models::{AgentDefinition, AgentId};

/// Errors raised by the Agent Registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentRegistryError {
    #[error("duplicate agent id '{0}'")]
    DuplicateAgent(String),
    #[error("agent '{0}' has a non-positive resource field")]
    InvalidResources(String),
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
}

/// Exposes `get(id)` plus load-time validation (§4.A).
pub trait AgentRegistry: Send + Sync {
    fn get(&self, id: &AgentId) -> Option<AgentDefinition>;
    fn known_ids(&self) -> HashSet<AgentId>;
    fn list(&self) -> Vec<AgentDefinition>;
}

#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentDefinition>>,
}

impl InMemoryAgentRegistry {
    /// Load a catalog, validating per §4.A: unique ids (enforced by the
    /// `HashMap` build itself) and every resource field positive.
    pub fn load(catalog: Vec<AgentDefinition>) -> Result<Self, AgentRegistryError> {
        let mut agents = HashMap::with_capacity(catalog.len());
        for def in catalog {
            if !def.resources.is_valid() {
                return Err(AgentRegistryError::InvalidResources(
                    def.id.as_str().to_string(),
                ));
            }
            if agents.insert(def.id.clone(), def.clone()).is_some() {
                return Err(AgentRegistryError::DuplicateAgent(
                    def.id.as_str().to_string(),
                ));
            }
        }
        Ok(Self {
            agents: RwLock::new(agents),
        })
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn get(&self, id: &AgentId) -> Option<AgentDefinition> {
        self.agents.read().unwrap().get(id).cloned()
    }

    fn known_ids(&self) -> HashSet<AgentId> {
        self.agents.read().unwrap().keys().cloned().collect()
    }

    fn list(&self) -> Vec<AgentDefinition> {
        self.agents.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentCapabilities, AgentCategory, ResourceLimits};
    use std::collections::HashMap as StdHashMap;

    fn def(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: AgentId::from(id),
            category: AgentCategory::Content,
            version: "1.0.0".to_string(),
            input_contract: StdHashMap::new(),
            output_contract: StdHashMap::new(),
            capabilities: AgentCapabilities::default(),
            resources: ResourceLimits {
                max_runtime_seconds: 30,
                max_tokens: 1000,
                max_memory_mb: 128,
            },
        }
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let err = InMemoryAgentRegistry::load(vec![def("a"), def("a")]).unwrap_err();
        assert!(matches!(err, AgentRegistryError::DuplicateAgent(_)));
    }

    #[test]
    fn load_rejects_non_positive_resources() {
        let mut bad = def("a");
        bad.resources.max_runtime_seconds = 0;
        let err = InMemoryAgentRegistry::load(vec![bad]).unwrap_err();
        assert!(matches!(err, AgentRegistryError::InvalidResources(_)));
    }

    #[test]
    fn get_returns_loaded_agent() {
        let registry = InMemoryAgentRegistry::load(vec![def("a")]).unwrap();
        assert!(registry.get(&AgentId::from("a")).is_some());
        assert!(registry.get(&AgentId::from("ghost")).is_none());
    }
}

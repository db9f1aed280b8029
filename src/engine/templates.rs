//! Template Registry (§4.B).
//!
//! Loads workflow templates, compiles each one (topological order + cycle
//! check, see `models::template::compile`), and keeps both the raw
//! definition and the compiled form in memory. Same repository-pattern
//! shape as `AgentRegistry`.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::engine::registry::AgentRegistry;
use crate::models::{compile, CompiledTemplate, TemplateCompileError, WorkflowId, WorkflowTemplate};

pub trait TemplateRegistry: Send + Sync {
    fn get(&self, id: &WorkflowId) -> Option<CompiledTemplate>;
    fn list(&self) -> Vec<WorkflowTemplate>;
}

#[derive(Default)]
pub struct InMemoryTemplateRegistry {
    templates: RwLock<HashMap<WorkflowId, CompiledTemplate>>,
}

impl InMemoryTemplateRegistry {
    pub fn load(
        catalog: Vec<WorkflowTemplate>,
        agents: &dyn AgentRegistry,
    ) -> Result<Self, TemplateCompileError> {
        let known_agents = agents.known_ids();
        let mut templates = HashMap::with_capacity(catalog.len());
        for template in catalog {
            let id = template.id.clone();
            let compiled = compile(template, &known_agents)?;
            templates.insert(id, compiled);
        }
        Ok(Self {
            templates: RwLock::new(templates),
        })
    }
}

impl TemplateRegistry for InMemoryTemplateRegistry {
    fn get(&self, id: &WorkflowId) -> Option<CompiledTemplate> {
        self.templates.read().unwrap().get(id).cloned()
    }

    fn list(&self) -> Vec<WorkflowTemplate> {
        self.templates
            .read()
            .unwrap()
            .values()
            .map(|c| c.template.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::InMemoryAgentRegistry;
    use crate::models::{
        AgentCapabilities, AgentCategory, AgentDefinition, ResourceLimits, StepDefinition, StepId,
    };
    use std::collections::{HashMap as StdHashMap, HashSet};

    fn agent(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: crate::models::AgentId::from(id),
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
    fn load_compiles_and_stores_templates() {
        let agents = InMemoryAgentRegistry::load(vec![agent("writer")]).unwrap();
        let template = WorkflowTemplate {
            id: WorkflowId::from("two_step"),
            name: "two step".to_string(),
            description: String::new(),
            steps: vec![
                StepDefinition {
                    step_id: StepId::from("A"),
                    agent_id: crate::models::AgentId::from("writer"),
                    static_params: serde_json::json!({}),
                    depends_on: HashSet::new(),
                    checkpoint_boundary: true,
                },
                StepDefinition {
                    step_id: StepId::from("B"),
                    agent_id: crate::models::AgentId::from("writer"),
                    static_params: serde_json::json!({}),
                    depends_on: [StepId::from("A")].into_iter().collect(),
                    checkpoint_boundary: true,
                },
            ],
            entry_inputs: StdHashMap::new(),
        };
        let registry = InMemoryTemplateRegistry::load(vec![template], &agents).unwrap();
        let compiled = registry.get(&WorkflowId::from("two_step")).unwrap();
        assert_eq!(compiled.topo_order.len(), 2);
    }
}

//! Agent definitions (§3, §4.A).
//!
//! An agent is an immutable, contract-bound unit of work loaded once at
//! startup by the Agent Registry. Unlike the teacher's `AgentDefinition`,
//! which couples an agent to one LLM provider/prompt pair, this shape keeps
//! the agent generic: it only declares the data contract and resource
//! limits a step runs under, because what the agent *does* is a collaborator
//! concern out of this crate's scope (§1).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::AgentId;

/// Category an agent belongs to, used for registry bookkeeping and
/// dashboards. Closed set per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Ingestion,
    Research,
    Content,
    Code,
    Seo,
    Publishing,
    Support,
}

/// A single field's type descriptor within an input/output contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    List,
}

/// One field of an agent's input or output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub field_type: FieldType,
    pub required: bool,
}

/// An input or output contract: field name -> descriptor.
pub type Contract = HashMap<String, FieldDescriptor>;

/// Capability flags an agent declares (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub async_safe: bool,
    pub stateful: bool,
    pub model_switchable: bool,
}

/// Resource limits enforced by the scheduler around a single step
/// invocation (§5 deadline, §3 resources).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_runtime_seconds: u64,
    pub max_tokens: u32,
    pub max_memory_mb: u32,
}

impl ResourceLimits {
    /// §4.A: "every resource field positive".
    pub fn is_valid(&self) -> bool {
        self.max_runtime_seconds > 0 && self.max_tokens > 0 && self.max_memory_mb > 0
    }
}

/// An immutable agent definition, loaded once at startup (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub category: AgentCategory,
    pub version: String,
    pub input_contract: Contract,
    pub output_contract: Contract,
    pub capabilities: AgentCapabilities,
    pub resources: ResourceLimits,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: AgentId::from(id),
            category: AgentCategory::Content,
            version: "1.0.0".to_string(),
            input_contract: HashMap::new(),
            output_contract: HashMap::new(),
            capabilities: AgentCapabilities::default(),
            resources: ResourceLimits {
                max_runtime_seconds: 30,
                max_tokens: 2000,
                max_memory_mb: 256,
            },
        }
    }

    #[test]
    fn resource_limits_reject_non_positive_fields() {
        let mut def = sample("writer");
        assert!(def.resources.is_valid());
        def.resources.max_tokens = 0;
        assert!(!def.resources.is_valid());
    }
}

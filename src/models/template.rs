//! Workflow templates: a DAG of named agent steps (§3, §4.B).
//!
//! Generalizes the teacher's `WorkflowDefinition` (a Petri-net place/activity
//! graph that explicitly supports cycles) to a strict DAG of steps with
//! explicit `depends_on` edges. The graph-analysis idiom — `HashSet`-based
//! membership checks, an explicit `Vec` used as a DFS stack — carries over
//! directly from `WorkflowDefinition::find_unreachable_states`; what changes
//! is the algorithm, not the style: cycle detection here needs three-color
//! DFS rather than simple reachability, because a DAG template must reject
//! cycles outright rather than merely report unreachable nodes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::agent::FieldDescriptor;
use super::{AgentId, StepId, WorkflowId};

/// A single step in a template: which agent to run, its static parameters,
/// and the set of steps it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_id: StepId,
    pub agent_id: AgentId,
    pub static_params: serde_json::Value,
    pub depends_on: HashSet<StepId>,
    /// Per-template override of the checkpoint-on-every-step default (§9
    /// open question iii).
    pub checkpoint_boundary: bool,
}

/// Typed schema the submitter must satisfy at job creation (§3).
pub type EntrySchema = HashMap<String, FieldDescriptor>;

/// An immutable workflow template, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub steps: Vec<StepDefinition>,
    pub entry_inputs: EntrySchema,
}

/// Errors raised while compiling a template (§4.B `TemplateCompileError`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateCompileError {
    #[error("step '{step}' references unknown agent '{agent}'")]
    UnknownAgent { step: String, agent: String },
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
    #[error("dependency cycle detected involving step '{0}'")]
    Cycle(String),
}

/// The compiled form of a template: topological order and adjacency cached
/// alongside the definition, exactly once at load (§4.B).
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub template: WorkflowTemplate,
    /// Steps in topological order; ties broken by declaration order, which
    /// is what gives the scheduler its deterministic dispatch ordering
    /// under a fixed concurrency cap (§4.F).
    pub topo_order: Vec<StepId>,
    pub step_index: HashMap<StepId, usize>,
}

impl CompiledTemplate {
    pub fn step(&self, step_id: &StepId) -> Option<&StepDefinition> {
        self.template
            .steps
            .iter()
            .find(|s| &s.step_id == step_id)
    }

    pub fn topo_position(&self, step_id: &StepId) -> usize {
        self.step_index.get(step_id).copied().unwrap_or(usize::MAX)
    }
}

/// Compile a template: validate structure and compute topological order.
///
/// `known_agents` lets the caller (the Template Registry) check that every
/// `agent_id` resolves in the Agent Registry without this module depending
/// on the registry type directly.
pub fn compile(
    template: WorkflowTemplate,
    known_agents: &HashSet<AgentId>,
) -> Result<CompiledTemplate, TemplateCompileError> {
    let mut seen = HashSet::new();
    for step in &template.steps {
        if !seen.insert(step.step_id.clone()) {
            return Err(TemplateCompileError::DuplicateStep(
                step.step_id.as_str().to_string(),
            ));
        }
        if !known_agents.contains(&step.agent_id) {
            return Err(TemplateCompileError::UnknownAgent {
                step: step.step_id.as_str().to_string(),
                agent: step.agent_id.as_str().to_string(),
            });
        }
        for dep in &step.depends_on {
            if !template.steps.iter().any(|s| &s.step_id == dep) {
                return Err(TemplateCompileError::UnknownDependency {
                    step: step.step_id.as_str().to_string(),
                    dependency: dep.as_str().to_string(),
                });
            }
        }
    }

    let topo_order = topological_sort(&template)?;
    let step_index = topo_order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();

    Ok(CompiledTemplate {
        template,
        topo_order,
        step_index,
    })
}

/// Three-color DFS topological sort with cycle detection. White = unvisited,
/// gray = on the current DFS path, black = fully processed.
fn topological_sort(template: &WorkflowTemplate) -> Result<Vec<StepId>, TemplateCompileError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: HashMap<StepId, Color> = template
        .steps
        .iter()
        .map(|s| (s.step_id.clone(), Color::White))
        .collect();
    let mut order = Vec::with_capacity(template.steps.len());

    fn visit(
        step_id: &StepId,
        template: &WorkflowTemplate,
        colors: &mut HashMap<StepId, Color>,
        order: &mut Vec<StepId>,
    ) -> Result<(), TemplateCompileError> {
        match colors.get(step_id) {
            Some(Color::Black) => return Ok(()),
            Some(Color::Gray) => {
                return Err(TemplateCompileError::Cycle(step_id.as_str().to_string()))
            }
            _ => {}
        }
        colors.insert(step_id.clone(), Color::Gray);
        let step = template
            .steps
            .iter()
            .find(|s| &s.step_id == step_id)
            .expect("step existence checked before sorting");
        for dep in &step.depends_on {
            visit(dep, template, colors, order)?;
        }
        colors.insert(step_id.clone(), Color::Black);
        order.push(step_id.clone());
        Ok(())
    }

    // Visit in declaration order so ties in the resulting topological order
    // favor the template author's written order (§4.F determinism).
    for step in &template.steps {
        visit(&step.step_id, template, &mut colors, &mut order)?;
    }

    Ok(order)
}

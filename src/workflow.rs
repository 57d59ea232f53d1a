//! Workflow steps and the engine that moves nodes through them.
//!
//! A workflow is a container node whose children are steps. Steps name their
//! successors in the `truestep` / `falsestep` attributes. A node sits in a
//! step by being one of the step's children.

use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;
use crate::error::RepositoryError;
use crate::versioning::Transaction;
use crate::{Node, NodeId, Repository, VersionId};

pub const STEP_PREFIX: &str = "workflowstep_";
pub const TRUE_STEP_ATTR: &str = "truestep";
pub const FALSE_STEP_ATTR: &str = "falsestep";

/// What a step wants to happen after its action ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Move on to the true or false successor.
    Forward(bool),
    /// Keep the node in this step.
    Wait,
}

/// Read-only facts a step action may use.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step: Node,
    pub key_length: usize,
}

pub trait WorkflowStep: Send + Sync {
    fn step_type(&self) -> &'static str;

    fn run_action(&self, node: &mut Node, ctx: &StepContext) -> StepOutcome;
}

pub struct StartStep;

impl WorkflowStep for StartStep {
    fn step_type(&self) -> &'static str {
        "workflowstep_start"
    }

    fn run_action(&self, _node: &mut Node, _ctx: &StepContext) -> StepOutcome {
        StepOutcome::Forward(true)
    }
}

pub struct EndStep;

impl WorkflowStep for EndStep {
    fn step_type(&self) -> &'static str {
        "workflowstep_end"
    }

    fn run_action(&self, _node: &mut Node, _ctx: &StepContext) -> StepOutcome {
        StepOutcome::Wait
    }
}

/// Protects a node by giving it a fresh random access key.
pub struct ProtectStep;

impl WorkflowStep for ProtectStep {
    fn step_type(&self) -> &'static str {
        "workflowstep_protect"
    }

    fn run_action(&self, node: &mut Node, ctx: &StepContext) -> StepOutcome {
        node.set("key", make_key(ctx.key_length));
        StepOutcome::Forward(true)
    }
}

/// Restores the access key kept in the node's system attributes.
pub struct ReauthStep;

impl WorkflowStep for ReauthStep {
    fn step_type(&self) -> &'static str {
        "workflowstep_reauth"
    }

    fn run_action(&self, node: &mut Node, _ctx: &StepContext) -> StepOutcome {
        match node.system_attr("key").map(str::to_string) {
            Some(key) => node.set("key", key),
            None => {
                node.remove_attr("key");
            }
        }
        StepOutcome::Forward(true)
    }
}

pub fn make_key(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown step type {0}")]
    UnknownStepType(String),
    #[error("node {0} is not a workflow")]
    NotAWorkflow(NodeId),
    #[error("node {0} is not a workflow step")]
    NotAStep(NodeId),
    #[error("workflow {0} has no start step")]
    NoStartStep(NodeId),
    #[error("node {node} is not in step {step}")]
    NotInStep { node: NodeId, step: NodeId },
    #[error("workflow run for node {node} exceeded {max_hops} steps")]
    TooManyHops { node: NodeId, max_hops: usize },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Step implementations keyed by step node type.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<&'static str, Arc<dyn WorkflowStep>>,
}

impl StepRegistry {
    /// Registry with the built-in start, end, protect and reauth steps.
    pub fn with_builtin_steps() -> Self {
        let mut registry = Self::default();
        registry.register_step(Arc::new(StartStep));
        registry.register_step(Arc::new(EndStep));
        registry.register_step(Arc::new(ProtectStep));
        registry.register_step(Arc::new(ReauthStep));
        registry
    }

    pub fn register_step(&mut self, step: Arc<dyn WorkflowStep>) {
        self.steps.insert(step.step_type(), step);
    }

    pub fn get(&self, step_type: &str) -> Option<&Arc<dyn WorkflowStep>> {
        self.steps.get(step_type)
    }
}

/// Summary of one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRun {
    pub node: NodeId,
    pub final_step: NodeId,
    pub hops: usize,
    pub versions: Vec<VersionId>,
}

pub struct WorkflowEngine {
    registry: StepRegistry,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    pub fn new(registry: StepRegistry, config: WorkflowConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry_mut(&mut self) -> &mut StepRegistry {
        &mut self.registry
    }

    pub fn create_workflow(
        &self,
        repo: &mut Repository,
        parent: NodeId,
        name: &str,
    ) -> Result<NodeId, WorkflowError> {
        Ok(repo.create_node(parent, Node::new("workflow", name))?)
    }

    /// Add a step to a workflow. Successors are step names within the same
    /// workflow and may be added later.
    pub fn add_step(
        &self,
        repo: &mut Repository,
        workflow: NodeId,
        step_type: &str,
        name: &str,
        truestep: Option<&str>,
        falsestep: Option<&str>,
    ) -> Result<NodeId, WorkflowError> {
        self.workflow_node(repo, workflow)?;
        if self.registry.get(step_type).is_none() {
            return Err(WorkflowError::UnknownStepType(step_type.to_string()));
        }
        let mut step = Node::new(step_type, name);
        if let Some(t) = truestep {
            step.set(TRUE_STEP_ATTR, t);
        }
        if let Some(f) = falsestep {
            step.set(FALSE_STEP_ATTR, f);
        }
        Ok(repo.create_node(workflow, step)?)
    }

    pub fn steps<'r>(&self, repo: &'r Repository, workflow: NodeId) -> Vec<&'r Node> {
        repo.store()
            .children(workflow)
            .into_iter()
            .filter(|n| n.node_type.starts_with(STEP_PREFIX))
            .collect()
    }

    /// The step of `workflow` currently holding `node`.
    pub fn current_step(&self, repo: &Repository, workflow: NodeId, node: NodeId) -> Option<NodeId> {
        repo.store()
            .parent_ids(node)
            .into_iter()
            .find(|p| repo.store().parent_ids(*p).contains(&workflow) && is_step(repo, *p))
    }

    /// Put `node` into the workflow's start step and run it.
    pub fn start(
        &self,
        repo: &mut Repository,
        workflow: NodeId,
        node: NodeId,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.workflow_node(repo, workflow)?;
        let start = self
            .steps(repo, workflow)
            .into_iter()
            .find(|s| s.node_type == "workflowstep_start")
            .map(|s| s.id)
            .ok_or(WorkflowError::NoStartStep(workflow))?;
        repo.store().node(node).map_err(RepositoryError::from)?;
        repo.store_mut()
            .link(start, node)
            .map_err(RepositoryError::from)?;
        info!(%workflow, %node, "node entered workflow");
        self.run(repo, start, node)
    }

    /// Run the action of `step` on `node` and keep forwarding until a step
    /// waits, a step has no successor, or the hop limit is reached. Every
    /// step commits its own transaction.
    pub fn run(
        &self,
        repo: &mut Repository,
        step: NodeId,
        node: NodeId,
    ) -> Result<WorkflowRun, WorkflowError> {
        let mut current = step;
        let mut hops = 0;
        let mut versions = Vec::new();

        loop {
            let step_node = repo.store().node(current).map_err(RepositoryError::from)?.clone();
            if !step_node.node_type.starts_with(STEP_PREFIX) {
                return Err(WorkflowError::NotAStep(current));
            }
            if !repo.store().child_ids(current).contains(&node) {
                return Err(WorkflowError::NotInStep {
                    node,
                    step: current,
                });
            }
            let action = self
                .registry
                .get(&step_node.node_type)
                .cloned()
                .ok_or_else(|| WorkflowError::UnknownStepType(step_node.node_type.clone()))?;

            let ctx = StepContext {
                step: step_node,
                key_length: self.config.key_length,
            };
            let outcome = repo.update_node(node, |n| action.run_action(n, &ctx))?;
            debug!(step = %ctx.step.name, %node, ?outcome, "ran workflow step");

            let tx = Transaction::new(None).with_meta("workflow_step", ctx.step.name.clone());
            let next = match outcome {
                StepOutcome::Wait => None,
                StepOutcome::Forward(_) if hops >= self.config.max_hops => {
                    // keep the step's own changes, the node stays where it is
                    repo.commit_transaction(tx)?;
                    warn!(step = %ctx.step.name, %node, hops, "workflow hop limit reached");
                    return Err(WorkflowError::TooManyHops {
                        node,
                        max_hops: self.config.max_hops,
                    });
                }
                StepOutcome::Forward(decision) => self.forward(repo, current, node, decision)?,
            };
            versions.extend(repo.commit_transaction(tx)?);

            match next {
                Some(next) => {
                    current = next;
                    hops += 1;
                }
                None => {
                    return Ok(WorkflowRun {
                        node,
                        final_step: current,
                        hops,
                        versions,
                    })
                }
            }
        }
    }

    /// Move `node` from `step` to its true or false successor without running
    /// it. Returns the new step, or `None` when no successor is configured.
    pub fn forward(
        &self,
        repo: &mut Repository,
        step: NodeId,
        node: NodeId,
        decision: bool,
    ) -> Result<Option<NodeId>, WorkflowError> {
        let step_node = repo.store().node(step).map_err(RepositoryError::from)?;
        let attr = if decision { TRUE_STEP_ATTR } else { FALSE_STEP_ATTR };
        let Some(target_name) = step_node.get(attr).map(str::to_string) else {
            warn!(step = %step_node.name, decision, "step has no successor, node stays");
            return Ok(None);
        };

        let workflow = repo
            .store()
            .parent_ids(step)
            .into_iter()
            .find(|p| {
                repo.store()
                    .get(p)
                    .map(|n| n.node_type == "workflow")
                    .unwrap_or(false)
            })
            .ok_or(WorkflowError::NotAStep(step))?;
        let Some(target) = self
            .steps(repo, workflow)
            .into_iter()
            .find(|s| s.name == target_name)
            .map(|s| s.id)
        else {
            warn!(step = %step, target = %target_name, "successor step not found, node stays");
            return Ok(None);
        };

        repo.store_mut()
            .relink(step, target, node)
            .map_err(RepositoryError::from)?;
        debug!(from = %step, to = %target, %node, "forwarded node");
        Ok(Some(target))
    }

    fn workflow_node<'r>(&self, repo: &'r Repository, id: NodeId) -> Result<&'r Node, WorkflowError> {
        let node = repo.store().node(id).map_err(RepositoryError::from)?;
        if node.node_type != "workflow" {
            return Err(WorkflowError::NotAWorkflow(id));
        }
        Ok(node)
    }
}

fn is_step(repo: &Repository, id: NodeId) -> bool {
    repo.store()
        .get(&id)
        .map(|n| n.node_type.starts_with(STEP_PREFIX))
        .unwrap_or(false)
}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::ResizeExecutor;
use crate::recommend::{Proposal, ResizeDirection};
use crate::resources::{parse_cpu, parse_memory, ContainerResources};

const FIELD_MANAGER: &str = "kube-rightsize";

/* ============================= TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Approved,
    Blocked,
    Executing,
    Completed,
    Failed,
}

/// What the action operates on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTarget {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Approval sub-record attached once someone signs off.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionApproval {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
}

/// A side-effecting remediation action with its lifecycle state.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: String,
    pub action_type: String,
    pub target: ActionTarget,
    pub parameters: BTreeMap<String, Value>,
    pub risk: RiskLevel,
    pub status: ActionStatus,
    pub approval: Option<ActionApproval>,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

impl Action {
    pub fn new(action_type: impl Into<String>, target: ActionTarget) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            target,
            parameters: BTreeMap::new(),
            risk: RiskLevel::Low,
            status: ActionStatus::Pending,
            approval: None,
            timeout: Duration::from_secs(60),
            created_at: Utc::now(),
            executed_at: None,
            result: None,
        }
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn approve(&mut self, by: impl Into<String>) {
        self.approval = Some(ActionApproval {
            approved_by: by.into(),
            approved_at: Utc::now(),
        });
        self.status = ActionStatus::Approved;
    }

    fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| v.as_u64())
    }
}

/// How a run ended without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(String),
    /// Approval is required and missing; the action was parked pending.
    NeedsApproval,
}

#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("unknown action type '{0}'")]
    UnknownAction(String),

    #[error("action validation failed: {0}")]
    Validation(String),

    #[error("action type '{0}' is blocked")]
    Blocked(String),

    #[error("action timed out after {0:?}")]
    Timeout(Duration),

    #[error("action failed: {0}")]
    Failed(String),
}

/* ============================= HANDLER CONTRACT ============================= */

/// A remediation handler: validation, risk classification, approval
/// policy, and the side effect itself.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn validate(&self, action: &Action) -> Result<(), String>;

    fn calculate_risk(&self, action: &Action) -> RiskLevel;

    fn requires_approval(&self, action: &Action) -> bool;

    async fn execute(&self, action: &Action) -> Result<String, String>;
}

/* ============================= ENGINE ============================= */

/// Registry of action handlers plus the execution policy around them.
pub struct RemediationEngine {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    blocked: HashSet<String>,
    dry_run: bool,
    safety_timeout: Duration,
}

impl RemediationEngine {
    pub fn new(dry_run: bool, safety_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            blocked: HashSet::new(),
            dry_run,
            safety_timeout,
        }
    }

    /// Engine with the default handler set wired to the cluster.
    pub fn with_defaults(
        client: Client,
        executor: Arc<ResizeExecutor>,
        dry_run: bool,
        safety_timeout: Duration,
    ) -> Self {
        let mut engine = Self::new(dry_run, safety_timeout);
        engine.register("restart_pod", Arc::new(RestartPodHandler { client: client.clone() }));
        engine.register("scale", Arc::new(ScaleHandler { client: client.clone() }));
        engine.register(
            "resize",
            Arc::new(ResizeHandler {
                client,
                executor,
                safety_timeout,
            }),
        );
        engine.register("inject_constraint", Arc::new(InjectConstraintHandler::new()));
        engine
    }

    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    pub fn block(&mut self, action_type: impl Into<String>) {
        self.blocked.insert(action_type.into());
    }

    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one action through validate, risk classification, the block
    /// list, the approval gate, and finally the handler under the safety
    /// timeout. Dry-run short-circuits the side effect to a no-op success.
    pub async fn run(&self, action: &mut Action) -> Result<RunOutcome, RemediationError> {
        let handler = self
            .handlers
            .get(&action.action_type)
            .ok_or_else(|| RemediationError::UnknownAction(action.action_type.clone()))?
            .clone();

        handler
            .validate(action)
            .map_err(RemediationError::Validation)?;

        action.risk = handler.calculate_risk(action);

        if self.blocked.contains(&action.action_type) {
            action.status = ActionStatus::Blocked;
            return Err(RemediationError::Blocked(action.action_type.clone()));
        }

        if handler.requires_approval(action) && action.approval.is_none() {
            action.status = ActionStatus::Pending;
            info!(
                action = %action.id,
                action_type = %action.action_type,
                risk = action.risk.as_str(),
                "remediation_awaiting_approval"
            );
            return Ok(RunOutcome::NeedsApproval);
        }

        action.status = ActionStatus::Executing;
        action.executed_at = Some(Utc::now());

        if self.dry_run {
            action.status = ActionStatus::Completed;
            action.result = Some("dry-run: no changes applied".to_string());
            return Ok(RunOutcome::Completed("dry-run: no changes applied".to_string()));
        }

        let deadline = self.safety_timeout.min(action.timeout);
        let run = {
            let action = action.clone();
            tokio::spawn(async move { handler.execute(&action).await })
        };

        let result = match tokio::time::timeout(deadline, run).await {
            Err(_) => {
                action.status = ActionStatus::Failed;
                return Err(RemediationError::Timeout(deadline));
            }
            Ok(Err(join_error)) => {
                // A panicking handler is converted into a failure.
                warn!(error = %join_error, "remediation_handler_panicked");
                action.status = ActionStatus::Failed;
                return Err(RemediationError::Failed(join_error.to_string()));
            }
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(message) => {
                action.status = ActionStatus::Completed;
                action.result = Some(message.clone());
                Ok(RunOutcome::Completed(message))
            }
            Err(error) => {
                action.status = ActionStatus::Failed;
                action.result = Some(error.clone());
                Err(RemediationError::Failed(error))
            }
        }
    }
}

/* ============================= DEFAULT HANDLERS ============================= */

/// Deletes the pod so its controller reschedules a fresh replica.
struct RestartPodHandler {
    client: Client,
}

#[async_trait]
impl ActionHandler for RestartPodHandler {
    fn validate(&self, action: &Action) -> Result<(), String> {
        if action.target.name.is_empty() || action.target.namespace.is_empty() {
            return Err("restart_pod requires a namespaced pod target".to_string());
        }
        Ok(())
    }

    fn calculate_risk(&self, _action: &Action) -> RiskLevel {
        RiskLevel::Medium
    }

    fn requires_approval(&self, _action: &Action) -> bool {
        true
    }

    async fn execute(&self, action: &Action) -> Result<String, String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &action.target.namespace);
        pods.delete(&action.target.name, &DeleteParams::default())
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!(
            "deleted pod {}/{} for restart",
            action.target.namespace, action.target.name
        ))
    }
}

/// Patches workload replica count.
struct ScaleHandler {
    client: Client,
}

#[async_trait]
impl ActionHandler for ScaleHandler {
    fn validate(&self, action: &Action) -> Result<(), String> {
        if action.param_u64("replicas").is_none() {
            return Err("scale requires a 'replicas' parameter".to_string());
        }
        if !matches!(action.target.kind.as_str(), "Deployment" | "StatefulSet") {
            return Err(format!("cannot scale kind '{}'", action.target.kind));
        }
        Ok(())
    }

    fn calculate_risk(&self, action: &Action) -> RiskLevel {
        // Scaling to zero takes the workload down entirely.
        if action.param_u64("replicas") == Some(0) {
            RiskLevel::Critical
        } else {
            RiskLevel::Medium
        }
    }

    fn requires_approval(&self, _action: &Action) -> bool {
        true
    }

    async fn execute(&self, action: &Action) -> Result<String, String> {
        let replicas = action
            .param_u64("replicas")
            .ok_or("missing 'replicas' parameter")?;
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        let params = PatchParams::apply(FIELD_MANAGER);

        match action.target.kind.as_str() {
            "Deployment" => {
                let api: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &action.target.namespace);
                api.patch(&action.target.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &action.target.namespace);
                api.patch(&action.target.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            other => return Err(format!("cannot scale kind '{other}'")),
        }

        Ok(format!(
            "scaled {}/{} to {replicas} replicas",
            action.target.namespace, action.target.name
        ))
    }
}

/// Applies an in-place resize through the executor.
struct ResizeHandler {
    client: Client,
    executor: Arc<ResizeExecutor>,
    safety_timeout: Duration,
}

impl ResizeHandler {
    /// Desired resources come from flat parameters, e.g.
    /// `{"cpuRequest": "216m", "memoryLimit": "1Gi", "container": "w"}`.
    fn desired_from(action: &Action) -> Result<ContainerResources, String> {
        let mut desired = ContainerResources::default();
        if let Some(q) = action.param_str("cpuRequest") {
            desired.requests.cpu_milli = Some(parse_cpu(q).map_err(|e| e.to_string())?);
        }
        if let Some(q) = action.param_str("cpuLimit") {
            desired.limits.cpu_milli = Some(parse_cpu(q).map_err(|e| e.to_string())?);
        }
        if let Some(q) = action.param_str("memoryRequest") {
            desired.requests.memory_mib = Some(parse_memory(q).map_err(|e| e.to_string())?);
        }
        if let Some(q) = action.param_str("memoryLimit") {
            desired.limits.memory_mib = Some(parse_memory(q).map_err(|e| e.to_string())?);
        }
        if desired.requests.is_empty() && desired.limits.is_empty() {
            return Err("resize requires at least one resource parameter".to_string());
        }
        Ok(desired)
    }
}

#[async_trait]
impl ActionHandler for ResizeHandler {
    fn validate(&self, action: &Action) -> Result<(), String> {
        if action.param_str("container").is_none() {
            return Err("resize requires a 'container' parameter".to_string());
        }
        Self::desired_from(action).map(|_| ())
    }

    fn calculate_risk(&self, _action: &Action) -> RiskLevel {
        RiskLevel::Low
    }

    fn requires_approval(&self, _action: &Action) -> bool {
        false
    }

    async fn execute(&self, action: &Action) -> Result<String, String> {
        let container = action
            .param_str("container")
            .ok_or("missing 'container' parameter")?;
        let desired = Self::desired_from(action)?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &action.target.namespace);
        let pod = pods
            .get(&action.target.name)
            .await
            .map_err(|e| e.to_string())?;

        let current = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.iter().find(|c| c.name == container))
            .and_then(|c| c.resources.as_ref())
            .map(|r| ContainerResources::from_k8s(r))
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();

        let proposal = Proposal {
            container: container.to_string(),
            current,
            desired,
            direction: ResizeDirection::Up,
            reason: "remediation".to_string(),
        };

        let outcome = self
            .executor
            .apply(&pod, &proposal, self.safety_timeout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("resize outcome: {outcome:?}"))
    }
}

/// Emits a constraint recommendation payload without touching the cluster;
/// the actual LimitRange authoring stays with the platform team.
struct InjectConstraintHandler {
    _private: (),
}

impl InjectConstraintHandler {
    fn new() -> Self {
        Self { _private: () }
    }
}

#[async_trait]
impl ActionHandler for InjectConstraintHandler {
    fn validate(&self, action: &Action) -> Result<(), String> {
        if action.parameters.is_empty() {
            return Err("inject_constraint requires constraint parameters".to_string());
        }
        Ok(())
    }

    fn calculate_risk(&self, _action: &Action) -> RiskLevel {
        RiskLevel::Low
    }

    fn requires_approval(&self, _action: &Action) -> bool {
        false
    }

    async fn execute(&self, action: &Action) -> Result<String, String> {
        let rendered = serde_json::to_string(&action.parameters).map_err(|e| e.to_string())?;
        Ok(format!(
            "constraint proposal for {}/{}: {rendered}",
            action.target.namespace, action.target.name
        ))
    }
}

/* ============================= ACTION MAPPING ============================= */

/// Map a recommendation's action label onto a registered handler type.
pub fn action_type_for(action: &str) -> &str {
    if action.starts_with("increase_") || action.starts_with("decrease_") {
        "resize"
    } else if action.starts_with("restart") {
        "restart_pod"
    } else if action.starts_with("scale") {
        "scale"
    } else if action.contains("constraint") {
        "inject_constraint"
    } else {
        action
    }
}

/* ============================= TESTS ============================= */

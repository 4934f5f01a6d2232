// Workflow runtime - topological graph evaluation with retries and idempotency

//! # Workflow Runtime
//!
//! Executes one workflow graph against one initial payload. The walk is
//! single-threaded per execution: nodes run in Kahn topological order, every
//! node resolves its parameters against the accumulated output map, and
//! role-specific handlers produce the node output:
//!
//! - **trigger** passes through the seeded event (or synthesizes a sample
//!   on dry-runs);
//! - **transform** is a pure function of its resolved parameters;
//! - **condition** selects exactly one outgoing branch and prunes the
//!   others' downstream subgraphs up to the rejoin node;
//! - **loop** iterates a declared body subgraph over a resolved collection
//!   with `item`/`index` aliases in scope;
//! - **action** resolves credentials and a runtime, then invokes the
//!   connector client with a per-node idempotency key and the node retry
//!   policy.
//!
//! Cancellation and the execution deadline are observed at node
//! boundaries; an in-flight connector call may finish but its result is
//! discarded. Node details persist incrementally so a crash loses at most
//! the node in flight.

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PlatformConfig;
use crate::connectors::{ClientResult, ExecuteOptions};
use crate::engine::credentials::CredentialResolver;
use crate::engine::expression::EvalScope;
use crate::engine::registry::{ConnectorRegistry, RuntimeChoice};
use crate::engine::resolver::ParameterResolver;
use crate::engine::storage::{ExecutionStore, PlatformStore};
use crate::models::{
    ExecutionRecord, ExecutionStatus, NodeRole, NodeRunDetail, NodeRunStatus, Organization,
    PlanTier, RetryPolicy, TriggerData, Workflow, WorkflowGraph, WorkflowNode,
};
use crate::{Result, SwitchyardError};

/// Soft per-node timeout on connector calls.
const NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Preview truncation bounds.
const PREVIEW_MAX_ARRAY: usize = 5;
const PREVIEW_MAX_KEYS: usize = 10;
const PREVIEW_MAX_DEPTH: usize = 4;

/// Per-plan execution deadline, overridable per workflow.
fn plan_deadline(plan: PlanTier) -> Duration {
    match plan {
        PlanTier::Free => Duration::from_secs(60),
        PlanTier::Starter => Duration::from_secs(120),
        PlanTier::Pro | PlanTier::Professional => Duration::from_secs(300),
        PlanTier::Enterprise => Duration::from_secs(600),
        PlanTier::EnterprisePlus => Duration::from_secs(900),
    }
}

/// The runtime service. One instance serves all executions; per-run state
/// lives on the stack of [`WorkflowRuntime::execute`].
pub struct WorkflowRuntime {
    registry: Arc<ConnectorRegistry>,
    credentials: Arc<CredentialResolver>,
    store: Arc<dyn PlatformStore>,
    config: Arc<PlatformConfig>,
}

/// Everything one run carries between nodes.
struct RunState {
    outputs: HashMap<String, Value>,
    skip: HashSet<String>,
    started: Instant,
    deadline: Duration,
    dry_run: bool,
    failed_nodes: Vec<String>,
}

impl WorkflowRuntime {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        credentials: Arc<CredentialResolver>,
        store: Arc<dyn PlatformStore>,
        config: Arc<PlatformConfig>,
    ) -> Self {
        WorkflowRuntime {
            registry,
            credentials,
            store,
            config,
        }
    }

    /// Run a workflow to a terminal status, mutating and incrementally
    /// persisting `record`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        organization: &Organization,
        initial: Option<TriggerData>,
        record: &mut ExecutionRecord,
        dry_run: bool,
    ) -> Result<ExecutionStatus> {
        let graph = &workflow.graph;
        let (order, cycle_suspected) = graph.topological_order();

        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        self.persist(record).await;

        let deadline = workflow
            .deadline_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| plan_deadline(organization.plan));

        let mut state = RunState {
            outputs: HashMap::new(),
            skip: HashSet::new(),
            started: Instant::now(),
            deadline,
            dry_run,
            failed_nodes: Vec::new(),
        };

        self.seed_trigger_outputs(graph, &initial, &mut state);

        for node_id in &order {
            // Node boundary: cancellation first, then the deadline.
            if self.store.is_cancel_requested(&record.id).await.unwrap_or(false) {
                record.status = ExecutionStatus::Cancelled;
                record.error = Some("cancelled by request".into());
                record.finished_at = Some(Utc::now());
                self.persist(record).await;
                return Ok(ExecutionStatus::Cancelled);
            }
            if state.started.elapsed() > state.deadline {
                record.status = ExecutionStatus::Failed;
                record.error = Some(format!(
                    "execution deadline of {}s elapsed",
                    state.deadline.as_secs()
                ));
                record.finished_at = Some(Utc::now());
                self.persist(record).await;
                return Ok(ExecutionStatus::Failed);
            }

            if state.skip.contains(node_id) {
                let mut detail = NodeRunDetail::default();
                detail.status = NodeRunStatus::Skipped;
                detail.summary = "skipped: pruned by an upstream condition or loop".into();
                record.record_node(node_id, detail);
                continue;
            }

            let Some(node) = graph.node(node_id) else {
                continue;
            };

            let mut detail = NodeRunDetail {
                started_at: Some(Utc::now()),
                ..NodeRunDetail::default()
            };
            if cycle_suspected.contains(node_id) {
                detail
                    .diagnostics
                    .insert("cycle_suspected".into(), Value::Bool(true));
            }

            match self.run_node(graph, node, workflow, organization, record, &mut state).await {
                Ok(output) => {
                    detail.status = NodeRunStatus::Succeeded;
                    detail.summary = output.summary;
                    detail.preview = Some(truncate_preview(&output.value, 0));
                    detail.parameters = output.parameters;
                    detail.logs = output.logs;
                    for (k, v) in output.diagnostics {
                        detail.diagnostics.insert(k, v);
                    }
                    detail.output = Some(output.value.clone());
                    state.outputs.insert(node_id.clone(), output.value);
                }
                Err(e) => {
                    detail.status = NodeRunStatus::Failed;
                    detail.summary = format!("failed: {e}");
                    detail.error = Some(e.to_string());
                    detail
                        .diagnostics
                        .insert("code".into(), Value::String(e.code().to_string()));
                    state.failed_nodes.push(node_id.clone());
                }
            }
            detail.finished_at = Some(Utc::now());
            let failed = detail.status == NodeRunStatus::Failed;
            record.record_node(node_id, detail);
            self.persist(record).await;

            if failed && workflow.stop_on_error {
                break;
            }
        }

        let status = if state.failed_nodes.is_empty() {
            ExecutionStatus::Succeeded
        } else {
            record.error = Some(format!(
                "{} node(s) failed: {}",
                state.failed_nodes.len(),
                state.failed_nodes.join(", ")
            ));
            ExecutionStatus::Failed
        };
        record.status = status;
        record.finished_at = Some(Utc::now());
        self.persist(record).await;
        Ok(status)
    }

    async fn persist(&self, record: &ExecutionRecord) {
        if let Err(e) = self.store.update_execution(record.clone()).await {
            tracing::error!(execution = %record.id, error = %e, "execution persist failed");
        }
    }

    /// Seed `trigger` and matching trigger-node outputs from the initial
    /// event. When no trigger node matches the event's `{app, trigger}`
    /// pair, the first trigger node in document order receives it.
    fn seed_trigger_outputs(
        &self,
        graph: &WorkflowGraph,
        initial: &Option<TriggerData>,
        state: &mut RunState,
    ) {
        let Some(data) = initial else { return };
        let seeded = serde_json::to_value(data).unwrap_or(Value::Null);
        state.outputs.insert("trigger".to_string(), seeded.clone());

        let mut matched = false;
        let mut first_trigger: Option<&WorkflowNode> = None;
        for node in &graph.nodes {
            let Ok(parsed) = node.parsed_type() else { continue };
            if parsed.role != NodeRole::Trigger {
                continue;
            }
            if first_trigger.is_none() {
                first_trigger = Some(node);
            }
            let Ok((app, function)) = node.binding() else { continue };
            if app == data.app_id && function == data.trigger_id && data.app_id.is_some() {
                state.outputs.insert(node.id.clone(), seeded.clone());
                matched = true;
            }
        }
        if !matched {
            if let Some(node) = first_trigger {
                state.outputs.insert(node.id.clone(), seeded);
            }
        }
    }

    fn run_node<'a>(
        &'a self,
        graph: &'a WorkflowGraph,
        node: &'a WorkflowNode,
        workflow: &'a Workflow,
        organization: &'a Organization,
        record: &'a ExecutionRecord,
        state: &'a mut RunState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<NodeOutput>> + Send + 'a>> {
        Box::pin(async move {
        let parsed = node.parsed_type()?;
        let resolved = ParameterResolver::resolve_tree(&node.data.parameters, &state.outputs);
        let mut diagnostics = Map::new();
        if !resolved.diagnostics.is_empty() {
            diagnostics.insert(
                "parameter_notes".into(),
                Value::Array(
                    resolved
                        .diagnostics
                        .iter()
                        .map(|d| Value::String(d.clone()))
                        .collect(),
                ),
            );
        }
        let params_value = Value::Object(resolved.values.clone());

        match parsed.role {
            NodeRole::Trigger => {
                let value = match state.outputs.get(&node.id) {
                    Some(seeded) => seeded.clone(),
                    None if state.dry_run => json!({
                        "sample": true,
                        "app": node.data.app.clone(),
                        "function": node.data.function.clone(),
                        "parameters": params_value,
                    }),
                    None => Value::Null,
                };
                Ok(NodeOutput {
                    summary: "trigger event".into(),
                    value,
                    parameters: None,
                    logs: Vec::new(),
                    diagnostics,
                })
            }
            NodeRole::Transform => Ok(NodeOutput {
                summary: "transformed input".into(),
                value: params_value.clone(),
                parameters: Some(params_value),
                logs: Vec::new(),
                diagnostics,
            }),
            NodeRole::Condition => {
                self.run_condition(graph, node, state, params_value, diagnostics)
            }
            NodeRole::Loop => {
                self.run_loop(graph, node, workflow, organization, record, state, diagnostics)
                    .await
            }
            NodeRole::Action => {
                self.run_action(node, organization, record, state, params_value, diagnostics)
                    .await
            }
        }
        })
    }

    /// Evaluate condition rules, select one outgoing branch, and prune the
    /// downstream subgraphs of every non-selected branch (transitively,
    /// stopping at nodes the selected branch can also reach).
    fn run_condition(
        &self,
        graph: &WorkflowGraph,
        node: &WorkflowNode,
        state: &mut RunState,
        params_value: Value,
        mut diagnostics: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let config = node.condition_config().unwrap_or_else(|| {
            crate::models::ConditionConfig {
                rules: Vec::new(),
                default_branch: None,
            }
        });

        let scope = EvalScope::from_outputs(&state.outputs);
        let mut selected: Option<Value> = None;
        let mut matched_rule = false;
        for rule in &config.rules {
            let outcome = crate::engine::expression::evaluate(&rule.expression, &scope);
            if let Some(value) = outcome.value {
                if value_truthy(&value) {
                    selected = Some(rule.branch.clone());
                    matched_rule = true;
                    break;
                }
            }
        }
        if selected.is_none() {
            selected = config.default_branch.clone();
        }

        let outgoing: Vec<_> = graph.edges_from(&node.id).collect();
        let selected_edge = selected.as_ref().and_then(|branch| {
            // Exact branch-value match first, then case-insensitive label.
            outgoing
                .iter()
                .find(|e| e.branch.as_ref() == Some(branch))
                .or_else(|| {
                    let label = branch.as_str().map(str::to_ascii_lowercase);
                    outgoing.iter().find(|e| {
                        e.label
                            .as_ref()
                            .map(|l| Some(l.to_ascii_lowercase()) == label)
                            .unwrap_or(false)
                    })
                })
                .copied()
        });
        let selected_edge = selected_edge.or_else(|| {
            // Fall back to a declared default edge.
            outgoing
                .iter()
                .find(|e| {
                    e.branch.as_ref().and_then(Value::as_str) == Some("default")
                        || e.label.as_deref().map(str::to_ascii_lowercase)
                            == Some("default".into())
                })
                .copied()
        });

        if let Some(edge) = selected_edge {
            diagnostics.insert(
                "selectedEdgeId".into(),
                edge.id.clone().map(Value::String).unwrap_or(Value::Null),
            );
            diagnostics.insert(
                "selectedTargetId".into(),
                Value::String(edge.target.clone()),
            );

            // Nodes the selected branch reaches stay; everything only
            // reachable through non-selected branches is pruned.
            let keep = reachable_from(graph, &edge.target);
            for other in &outgoing {
                if other.target == edge.target {
                    continue;
                }
                for pruned in prunable_from(graph, &other.target, &keep) {
                    state.skip.insert(pruned);
                }
            }
        } else {
            // No branch selected: every outgoing subgraph is pruned.
            let keep = HashSet::new();
            for other in &outgoing {
                for pruned in prunable_from(graph, &other.target, &keep) {
                    state.skip.insert(pruned);
                }
            }
        }

        let branch_value = selected.clone().unwrap_or(Value::Null);
        Ok(NodeOutput {
            summary: match (&selected, matched_rule) {
                (Some(v), true) => format!("matched branch {v}"),
                (Some(v), false) => format!("took default branch {v}"),
                (None, _) => "no branch matched".into(),
            },
            value: json!({ "branch": branch_value, "matched": matched_rule }),
            parameters: Some(params_value),
            logs: Vec::new(),
            diagnostics,
        })
    }

    /// Iterate the declared body subgraph over a resolved collection.
    fn run_loop<'a>(
        &'a self,
        graph: &'a WorkflowGraph,
        node: &'a WorkflowNode,
        workflow: &'a Workflow,
        organization: &'a Organization,
        record: &'a ExecutionRecord,
        state: &'a mut RunState,
        mut diagnostics: Map<String, Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<NodeOutput>> + Send + 'a>> {
        Box::pin(async move {
        let config = node.loop_config().ok_or_else(|| {
            SwitchyardError::InvalidGraph(format!("loop node {} has no body config", node.id))
        })?;

        let resolved = ParameterResolver::resolve_tree(&node.data.parameters, &state.outputs);
        let collection = resolved
            .values
            .get("collection")
            .or_else(|| resolved.values.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let item_alias = config.item_alias.clone().unwrap_or_else(|| "item".into());
        let body: Vec<&WorkflowNode> = graph
            .nodes
            .iter()
            .filter(|n| config.body.contains(&n.id))
            .collect();
        let limit = config.max_iterations.unwrap_or(usize::MAX);

        let mut iterations = Vec::new();
        for (index, item) in collection.iter().take(limit).enumerate() {
            // Per-iteration scope: outer outputs plus the loop aliases.
            let saved_outputs = state.outputs.clone();
            state.outputs.insert(item_alias.clone(), item.clone());
            if let Some(index_alias) = &config.index_alias {
                state.outputs.insert(index_alias.clone(), json!(index));
            }

            let mut iteration_record = Map::new();
            for body_node in &body {
                let parsed = body_node.parsed_type()?;
                // One level of loop nesting is not supported; a nested loop
                // records a diagnostic and is passed over.
                if parsed.role == NodeRole::Loop {
                    iteration_record.insert(
                        body_node.id.clone(),
                        json!({"skipped": "nested loop bodies are not executed"}),
                    );
                    continue;
                }
                let output = self
                    .run_node(graph, body_node, workflow, organization, record, state)
                    .await;
                match output {
                    Ok(out) => {
                        state.outputs.insert(body_node.id.clone(), out.value.clone());
                        iteration_record.insert(body_node.id.clone(), out.value);
                    }
                    Err(e) => {
                        iteration_record
                            .insert(body_node.id.clone(), json!({"error": e.to_string()}));
                    }
                }
            }
            iterations.push(Value::Object(iteration_record));

            // Restore the outer scope; loop-internal outputs do not leak.
            state.outputs = saved_outputs;
        }

        // The outer walk must not re-enter the body.
        for body_node in &body {
            state.skip.insert(body_node.id.clone());
        }
        diagnostics.insert("iterations".into(), json!(iterations.len()));

        Ok(NodeOutput {
            summary: format!("looped over {} item(s)", iterations.len()),
            value: json!({ "iterations": iterations, "count": iterations.len() }),
            parameters: None,
            logs: Vec::new(),
            diagnostics,
        })
        })
    }

    /// Invoke a connector action with runtime checks, credentials, retry
    /// policy and an idempotency key.
    async fn run_action(
        &self,
        node: &WorkflowNode,
        organization: &Organization,
        record: &ExecutionRecord,
        state: &mut RunState,
        params_value: Value,
        mut diagnostics: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let (app, function) = node.binding()?;
        let app = app.ok_or_else(|| SwitchyardError::MissingApp(node.id.clone()))?;
        let function_id =
            function.ok_or_else(|| SwitchyardError::MissingFunction(node.id.clone()))?;

        let entry = self
            .registry
            .get_function_by_type(&format!("action.{app}.{function_id}"))
            .ok_or_else(|| SwitchyardError::MissingFunction(format!("{app}.{function_id}")))?;

        // Runtime availability before anything with side effects.
        let choice = self.registry.resolve_runtime(
            &app,
            &entry.function,
            self.config.apps_script_enabled(&app),
        );
        let runtime_id = match &choice {
            RuntimeChoice::Native(id) => id.clone(),
            RuntimeChoice::Fallback(id) => {
                diagnostics.insert("runtime_fallback".into(), Value::Bool(true));
                id.clone()
            }
            RuntimeChoice::AppsScriptBlocked => {
                return Err(SwitchyardError::AppsScriptDisabled(app));
            }
            RuntimeChoice::Unavailable => {
                return Err(SwitchyardError::RuntimeUnavailable {
                    connector: app,
                    function: function_id,
                });
            }
        };
        diagnostics.insert("runtime".into(), Value::String(runtime_id));

        if state.dry_run {
            return Ok(NodeOutput {
                summary: format!("dry-run: would call {app}.{function_id}"),
                value: json!({ "simulated": true, "parameters": params_value.clone() }),
                parameters: Some(params_value),
                logs: vec!["dry-run: connector not invoked".into()],
                diagnostics,
            });
        }

        let bundle = self
            .credentials
            .resolve(node, organization, record.user_id.as_deref())
            .await?;

        let client = self
            .registry
            .get_api_client(&app)
            .ok_or_else(|| SwitchyardError::RuntimeUnavailable {
                connector: app.clone(),
                function: function_id.clone(),
            })?;

        let mut opts =
            ExecuteOptions::new(bundle, &record.id.to_string(), &node.id);
        opts.idempotency_key = record.idempotency_key(&node.id);
        opts.timeout = NODE_TIMEOUT;

        let policy = retry_policy_for(node);
        let max_attempts = policy.max_attempts();
        let mut logs = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let call = client.execute(&function_id, &params_value, &opts);
            let result = match tokio::time::timeout(NODE_TIMEOUT, call).await {
                Ok(result) => result,
                Err(_) => ClientResult::failed(
                    format!("call timed out after {}s", NODE_TIMEOUT.as_secs()),
                    None,
                ),
            };

            if result.success {
                diagnostics.insert("attempts".into(), json!(attempt));
                diagnostics.insert(
                    "execution_time_ms".into(),
                    json!(result.execution_time.as_millis() as u64),
                );
                return Ok(NodeOutput {
                    summary: format!("{app}.{function_id} succeeded"),
                    value: result.data.unwrap_or(Value::Null),
                    parameters: Some(params_value),
                    logs,
                    diagnostics,
                });
            }

            let error = result.error.clone().unwrap_or_else(|| "unknown error".into());
            let retryable = is_retryable(&result);
            logs.push(format!(
                "attempt {attempt}/{max_attempts} failed ({}): {error}",
                result
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "no status".into())
            ));

            if !retryable || attempt >= max_attempts {
                diagnostics.insert("attempts".into(), json!(attempt));
                return Err(SwitchyardError::IntegrationError(format!(
                    "{app}.{function_id}: {error}"
                )));
            }

            let delay = retry_delay(&policy, attempt, result.retry_after);
            logs.push(format!("retrying in {}ms", delay.as_millis()));
            tokio::time::sleep(delay).await;
        }
    }
}

/// Per-node retry override from `data.config.retry`, else the default
/// exponential policy.
fn retry_policy_for(node: &WorkflowNode) -> RetryPolicy {
    node.data
        .config
        .as_ref()
        .and_then(|c| c.get("retry"))
        .and_then(|r| serde_json::from_value(r.clone()).ok())
        .unwrap_or_default()
}

/// Retry classification: network errors and 5xx retry; 408/425/429 retry
/// (429 honoring Retry-After); other 4xx and structured quota/not-found
/// errors do not.
fn is_retryable(result: &ClientResult) -> bool {
    if let Some(error) = &result.error {
        let lowered = error.to_ascii_lowercase();
        if lowered.contains("quota_exceeded") || lowered.contains("_not_found") {
            return false;
        }
    }
    match result.status_code {
        None => true, // network-level failure
        Some(code) if code >= 500 => true,
        Some(408) | Some(425) | Some(429) => true,
        Some(_) => false,
    }
}

fn retry_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(after) = retry_after {
        return after;
    }
    let base = policy.base_delay(attempt);
    let jitter = policy.jitter();
    if jitter <= 0.0 {
        return base;
    }
    let spread = base.as_millis() as f64 * jitter;
    let sampled = rand::thread_rng().gen_range(0.0..=spread);
    base + Duration::from_millis(sampled as u64)
}

/// Output bundle from one node handler.
struct NodeOutput {
    summary: String,
    value: Value,
    parameters: Option<Value>,
    logs: Vec<String>,
    diagnostics: Map<String, Value>,
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// All nodes reachable from `start` (inclusive) following edges.
fn reachable_from(graph: &WorkflowGraph, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for edge in graph.edges_from(&id) {
            queue.push_back(edge.target.clone());
        }
    }
    seen
}

/// Nodes reachable from `start` that the kept set cannot reach; pruning
/// stops at rejoin nodes (members of `keep`).
fn prunable_from(graph: &WorkflowGraph, start: &str, keep: &HashSet<String>) -> Vec<String> {
    let mut pruned = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if keep.contains(&id) || !seen.insert(id.clone()) {
            continue;
        }
        pruned.push(id.clone());
        for edge in graph.edges_from(&id) {
            queue.push_back(edge.target.clone());
        }
    }
    pruned
}

/// Truncate a value for UI previews: arrays to 5 elements, objects to 10
/// keys, nesting to 4 levels, each with an explicit truncation marker.
pub fn truncate_preview(value: &Value, depth: usize) -> Value {
    if depth >= PREVIEW_MAX_DEPTH {
        return Value::String("…".into());
    }
    match value {
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(PREVIEW_MAX_ARRAY)
                .map(|v| truncate_preview(v, depth + 1))
                .collect();
            if items.len() > PREVIEW_MAX_ARRAY {
                out.push(Value::String(format!(
                    "… (+{} more)",
                    items.len() - PREVIEW_MAX_ARRAY
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().take(PREVIEW_MAX_KEYS) {
                out.insert(k.clone(), truncate_preview(v, depth + 1));
            }
            if map.len() > PREVIEW_MAX_KEYS {
                out.insert(
                    "__truncated".into(),
                    Value::String(format!("+{} keys", map.len() - PREVIEW_MAX_KEYS)),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::credentials::{CredentialCipher, CredentialResolver};
    use crate::engine::registry::{ConnectorManifest, ConnectorRegistry};
    use crate::engine::storage::{ExecutionStore, InMemoryStorage};
    use crate::models::{Durability, QueueRunRequest, TriggerType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted test client: fails `failures_before_success` times, then
    /// succeeds echoing the idempotency key.
    struct ScriptedClient {
        calls: AtomicU32,
        failures_before_success: u32,
        failure_status: Option<u16>,
    }

    #[async_trait]
    impl crate::connectors::ConnectorClient for ScriptedClient {
        fn connector_id(&self) -> &str {
            "scripted"
        }

        async fn test_connection(
            &self,
            _credentials: &crate::engine::credentials::CredentialBundle,
        ) -> ClientResult {
            ClientResult::ok(json!({"ok": true}), Duration::ZERO)
        }

        async fn execute(
            &self,
            function_id: &str,
            _params: &Value,
            opts: &ExecuteOptions,
        ) -> ClientResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                ClientResult::failed("upstream sad", self.failure_status)
            } else {
                ClientResult::ok(
                    json!({
                        "function": function_id,
                        "idempotency_key": opts.idempotency_key,
                        "call_number": n + 1,
                    }),
                    Duration::from_millis(5),
                )
            }
        }
    }

    fn manifest() -> ConnectorManifest {
        serde_json::from_value(json!({
            "connectors": [{
                "id": "scripted",
                "name": "Scripted",
                "availability": "stable",
                "actions": [{"id": "do_thing"}],
                "triggers": [{"id": "tick"}]
            }]
        }))
        .unwrap()
    }

    fn runtime_with_client(
        client: Arc<dyn crate::connectors::ConnectorClient>,
    ) -> (WorkflowRuntime, Arc<InMemoryStorage>) {
        let store = Arc::new(InMemoryStorage::new());
        let mut registry = ConnectorRegistry::new(manifest());
        registry.bind_client(client);
        let cipher =
            CredentialCipher::from_master_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
                .unwrap();
        let credentials = Arc::new(CredentialResolver::new(store.clone(), cipher));
        let runtime = WorkflowRuntime::new(
            Arc::new(registry),
            credentials,
            store.clone(),
            Arc::new(PlatformConfig::default()),
        );
        (runtime, store)
    }

    fn workflow(graph: Value) -> Workflow {
        Workflow {
            id: "wf-1".into(),
            name: "test".into(),
            organization_id: "org-1".into(),
            user_id: "u-1".into(),
            graph: serde_json::from_value(graph).unwrap(),
            stop_on_error: false,
            deadline_seconds: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn org() -> Organization {
        Organization::new("org-1", "Acme", PlanTier::Professional, "us-east-1")
    }

    fn trigger_data(payload: Value) -> TriggerData {
        TriggerData {
            app_id: Some("scripted".into()),
            trigger_id: Some("tick".into()),
            payload,
            headers: None,
            dedupe_token: Some("tok".into()),
            timestamp: Utc::now(),
            source: "webhook".into(),
        }
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord::queued(
            &QueueRunRequest {
                workflow_id: "wf-1".into(),
                organization_id: "org-1".into(),
                user_id: Some("u-1".into()),
                trigger_type: TriggerType::Webhook,
                trigger_data: None,
            },
            Durability::Durable,
        )
    }

    fn action_node(id: &str, extra_params: Value) -> Value {
        let mut params = serde_json::Map::new();
        params.insert("credentials".into(), json!({"token": "inline"}));
        if let Value::Object(map) = extra_params {
            params.extend(map);
        }
        json!({
            "id": id,
            "type": "action.scripted.do_thing",
            "data": {"app": "scripted", "function": "do_thing", "parameters": params}
        })
    }

    #[tokio::test]
    async fn linear_flow_runs_in_topological_order() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
            failure_status: None,
        });
        let (runtime, store) = runtime_with_client(client);
        let wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                {"id": "shape", "type": "transform",
                 "data": {"parameters": {"greeting": {"mode": "ref", "nodeId": "trigger", "path": "payload.name"}}}},
                action_node("send", json!({}))
            ],
            "edges": [
                {"source": "start", "target": "shape"},
                {"source": "shape", "target": "send"}
            ]
        }));
        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();

        let status = runtime
            .execute(&wf, &org(), Some(trigger_data(json!({"name": "ada"}))), &mut rec, false)
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(rec.node_order, vec!["start", "shape", "send"]);
        // Topological evidence: every node finished before its successor
        // started.
        let shape = &rec.nodes["shape"];
        let send = &rec.nodes["send"];
        assert!(shape.finished_at.unwrap() <= send.started_at.unwrap());
        assert_eq!(shape.output.as_ref().unwrap()["greeting"], json!("ada"));
        // The action saw the execution-scoped idempotency key.
        let send_out = send.output.as_ref().unwrap();
        assert_eq!(
            send_out["idempotency_key"],
            json!(format!("{}:send", rec.id))
        );
    }

    #[tokio::test]
    async fn condition_prunes_unselected_branch() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
            failure_status: None,
        });
        let (runtime, store) = runtime_with_client(client);
        let wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                {"id": "gate", "type": "condition",
                 "data": {"config": {
                     "rules": [{"expression": "trigger.payload.vip == true", "branch": "vip"}],
                     "default_branch": "standard"
                 }}},
                {"id": "vip_path", "type": "transform", "data": {"parameters": {"lane": "vip"}}},
                {"id": "standard_path", "type": "transform", "data": {"parameters": {"lane": "standard"}}},
                {"id": "merge", "type": "transform", "data": {"parameters": {"done": true}}}
            ],
            "edges": [
                {"source": "start", "target": "gate"},
                {"id": "e-vip", "source": "gate", "target": "vip_path", "branch": "vip"},
                {"id": "e-std", "source": "gate", "target": "standard_path", "branch": "standard"},
                {"source": "vip_path", "target": "merge"},
                {"source": "standard_path", "target": "merge"}
            ]
        }));
        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();

        let status = runtime
            .execute(&wf, &org(), Some(trigger_data(json!({"vip": true}))), &mut rec, false)
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(rec.nodes["vip_path"].status, NodeRunStatus::Succeeded);
        assert_eq!(rec.nodes["standard_path"].status, NodeRunStatus::Skipped);
        // The rejoin node still ran.
        assert_eq!(rec.nodes["merge"].status, NodeRunStatus::Succeeded);
        assert_eq!(
            rec.nodes["gate"].diagnostics["selectedTargetId"],
            json!("vip_path")
        );
        assert_eq!(
            rec.nodes["gate"].diagnostics["selectedEdgeId"],
            json!("e-vip")
        );
    }

    #[tokio::test]
    async fn loop_iterates_body_and_skips_outer_reentry() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
            failure_status: None,
        });
        let (runtime, store) = runtime_with_client(client);
        let wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                {"id": "each", "type": "loop",
                 "data": {
                    "parameters": {"collection": {"mode": "ref", "nodeId": "trigger", "path": "payload.orders"}},
                    "config": {"body": ["stamp"], "index_alias": "i"}
                 }},
                {"id": "stamp", "type": "transform",
                 "data": {"parameters": {
                     "order": {"mode": "ref", "nodeId": "item", "path": "id"},
                     "position": {"mode": "expr", "expression": "i + 1"}
                 }}}
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "stamp"}
            ]
        }));
        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();

        let payload = json!({"orders": [{"id": "o-1"}, {"id": "o-2"}]});
        let status = runtime
            .execute(&wf, &org(), Some(trigger_data(payload)), &mut rec, false)
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
        let each = rec.nodes["each"].output.as_ref().unwrap();
        assert_eq!(each["count"], json!(2));
        assert_eq!(each["iterations"][0]["stamp"]["order"], json!("o-1"));
        assert_eq!(each["iterations"][1]["stamp"]["position"], json!(2));
        // The body did not run again outside the loop.
        assert_eq!(rec.nodes["stamp"].status, NodeRunStatus::Skipped);
    }

    #[tokio::test]
    async fn action_retries_transient_failures() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 2,
            failure_status: Some(503),
        });
        let (runtime, store) = runtime_with_client(client.clone());
        let wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                action_node("send", json!({}))
            ],
            "edges": [{"source": "start", "target": "send"}]
        }));
        // Fast retry policy so the test does not sleep for seconds.
        let mut wf = wf;
        wf.graph.nodes[1].data.config = Some(json!({
            "retry": {"strategy": "fixed", "max_attempts": 3, "delay_ms": 1}
        }));

        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();
        let status = runtime
            .execute(&wf, &org(), Some(trigger_data(json!({}))), &mut rec, false)
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(rec.nodes["send"].diagnostics["attempts"], json!(3));
    }

    #[tokio::test]
    async fn client_4xx_does_not_retry() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 10,
            failure_status: Some(422),
        });
        let (runtime, store) = runtime_with_client(client.clone());
        let mut wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                action_node("send", json!({}))
            ],
            "edges": [{"source": "start", "target": "send"}]
        }));
        wf.graph.nodes[1].data.config = Some(json!({
            "retry": {"strategy": "fixed", "max_attempts": 5, "delay_ms": 1}
        }));

        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();
        let status = runtime
            .execute(&wf, &org(), Some(trigger_data(json!({}))), &mut rec, false)
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(rec.nodes["send"].diagnostics["attempts"], json!(1));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_observed_at_node_boundary() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
            failure_status: None,
        });
        let (runtime, store) = runtime_with_client(client);
        let wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                {"id": "shape", "type": "transform", "data": {"parameters": {}}}
            ],
            "edges": [{"source": "start", "target": "shape"}]
        }));
        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();
        store.request_cancel(&rec.id).await.unwrap();

        let status = runtime
            .execute(&wf, &org(), Some(trigger_data(json!({}))), &mut rec, false)
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);
        assert!(rec.nodes.is_empty());
    }

    #[tokio::test]
    async fn dry_run_does_not_invoke_connectors() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicU32::new(0),
            failures_before_success: 0,
            failure_status: None,
        });
        let (runtime, store) = runtime_with_client(client.clone());
        let wf = workflow(json!({
            "nodes": [
                {"id": "start", "type": "trigger.scripted.tick",
                 "data": {"app": "scripted", "function": "tick"}},
                action_node("send", json!({}))
            ],
            "edges": [{"source": "start", "target": "send"}]
        }));
        let mut rec = record();
        store.create_execution(rec.clone()).await.unwrap();
        let status = runtime
            .execute(&wf, &org(), None, &mut rec, true)
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        let send = rec.nodes["send"].output.as_ref().unwrap();
        assert_eq!(send["simulated"], json!(true));
        // Dry-run triggers synthesize a sample record.
        let start = rec.nodes["start"].output.as_ref().unwrap();
        assert_eq!(start["sample"], json!(true));
    }

    #[test]
    fn preview_truncation_bounds() {
        let big_array: Vec<u32> = (0..20).collect();
        let preview = truncate_preview(&json!(big_array), 0);
        let items = preview.as_array().unwrap();
        assert_eq!(items.len(), PREVIEW_MAX_ARRAY + 1);
        assert!(items[PREVIEW_MAX_ARRAY]
            .as_str()
            .unwrap()
            .contains("+15 more"));

        let mut big_object = Map::new();
        for i in 0..15 {
            big_object.insert(format!("k{i}"), json!(i));
        }
        let preview = truncate_preview(&Value::Object(big_object), 0);
        let map = preview.as_object().unwrap();
        assert_eq!(map.len(), PREVIEW_MAX_KEYS + 1);
        assert!(map.contains_key("__truncated"));
    }
}

//! Execution coordinator: agent sessions and per-operation permission checks.
//!
//! Every tool invocation an agent attempts goes through
//! [`Coordinator::check_permission`]: classify, evaluate, and for `ask`
//! suspend in the [`ApprovalBroker`] until a human answers. Policy and
//! approval failures never escape as errors; they become
//! [`PermissionResult::Deny`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::approval::{ApprovalBroker, ApprovalOutcome, ApprovalRequest, PendingSummary, RequestKind};
use crate::core::classifier::{classify_operation, classify_path, is_known_tool};
use crate::core::policy::{GitRequest, PolicyDecision, PolicyEngine, UnknownToolPolicy};
use crate::core::types::{OperationKind, PathCategory, PolicyBehavior};
use crate::io::config::ApprovalConfig;
use crate::io::git::Preflight;
use crate::protocol::{AgentMessage, MessageRole, ServerMessage};

/// Policy engine shared between the coordinator and configuration routes.
pub type SharedPolicy = Arc<RwLock<PolicyEngine>>;

pub const QUESTION_TOOL: &str = "AskUserQuestion";

/// Input keys that may carry the target path of a tool invocation.
const PATH_KEYS: &[&str] = &["file_path", "filePath", "path"];

/// Verdict returned to the agent runtime for one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionResult {
    Allow { updated_input: Value },
    Deny { message: String },
}

impl PermissionResult {
    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionResult::Allow { .. })
    }
}

/// Agent backend driven by the coordinator.
///
/// Implementations call [`SessionGate::check_permission`] before every tool
/// invocation and must treat `Deny` as final for that invocation.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<()>;
}

/// Everything a runtime needs for one session.
pub struct RunContext {
    pub session_id: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub gate: SessionGate,
    pub cancel: CancellationToken,
}

/// Session-scoped handle to the coordinator handed to runtimes.
#[derive(Clone)]
pub struct SessionGate {
    coordinator: Coordinator,
    session_id: String,
}

impl SessionGate {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn check_permission(&self, tool_name: &str, tool_input: Value) -> PermissionResult {
        self.coordinator
            .check_permission(&self.session_id, tool_name, tool_input)
            .await
    }

    /// Append to the session transcript and forward to the listener.
    pub async fn emit(&self, message: AgentMessage) {
        self.coordinator.record_message(&self.session_id, message).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub messages: Vec<AgentMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

struct SessionEntry {
    session: Session,
    cancel: CancellationToken,
}

struct Inner {
    policy: SharedPolicy,
    broker: Arc<ApprovalBroker>,
    approval: ApprovalConfig,
    workdir: PathBuf,
    runtime: Option<Arc<dyn AgentRuntime>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        policy: SharedPolicy,
        broker: Arc<ApprovalBroker>,
        approval: ApprovalConfig,
        workdir: impl Into<PathBuf>,
        runtime: Option<Arc<dyn AgentRuntime>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                broker,
                approval,
                workdir: workdir.into(),
                runtime,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> &SharedPolicy {
        &self.inner.policy
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.inner.broker
    }

    pub fn gate(&self, session_id: &str) -> SessionGate {
        SessionGate {
            coordinator: self.clone(),
            session_id: session_id.to_string(),
        }
    }

    /// Classify, evaluate and, if needed, ask a human about one tool call.
    #[instrument(skip_all, fields(session_id = %session_id, tool = %tool_name))]
    pub async fn check_permission(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: Value,
    ) -> PermissionResult {
        let tool_use_id = format!("tool-{}", uuid::Uuid::new_v4());
        if tool_name == QUESTION_TOOL {
            if let Some(questions) = tool_input.get("questions").filter(|q| q.is_array()) {
                let questions = questions.clone();
                return self
                    .ask_question(session_id, &tool_use_id, tool_input, questions)
                    .await;
            }
        }

        let ToolEvaluation {
            category,
            operation,
            decision,
            ..
        } = evaluate_tool(&*self.inner.policy.read().await, tool_name, &tool_input);
        info!(
            %category,
            %operation,
            behavior = %decision.behavior,
            locked = decision.locked,
            "policy decision"
        );

        match decision.behavior {
            PolicyBehavior::Allow => PermissionResult::Allow {
                updated_input: tool_input,
            },
            PolicyBehavior::Deny => PermissionResult::Deny {
                message: decision
                    .reason
                    .unwrap_or_else(|| format!("{tool_name} is denied by policy")),
            },
            PolicyBehavior::Ask => {
                let request = ApprovalRequest {
                    session_id: session_id.to_string(),
                    tool_use_id,
                    tool_name: tool_name.to_string(),
                    tool_input,
                    kind: RequestKind::Tool {
                        is_protected: decision.locked,
                        protected_reason: decision.reason,
                        category,
                        operation,
                    },
                };
                let outcome = self
                    .inner
                    .broker
                    .request_approval(request, self.inner.approval.tool_timeout())
                    .await;
                permission_from_outcome(tool_name, outcome)
            }
        }
    }

    /// Clarifying questions always let the agent continue; unanswered
    /// questions come back with empty answers.
    async fn ask_question(
        &self,
        session_id: &str,
        tool_use_id: &str,
        tool_input: Value,
        questions: Value,
    ) -> PermissionResult {
        let request = ApprovalRequest {
            session_id: session_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            tool_name: QUESTION_TOOL.to_string(),
            tool_input: tool_input.clone(),
            kind: RequestKind::Question { questions },
        };
        let outcome = self
            .inner
            .broker
            .request_approval(request, self.inner.approval.question_timeout())
            .await;
        match outcome {
            ApprovalOutcome::Approved { updated_input } => PermissionResult::Allow { updated_input },
            other => {
                debug!(outcome = ?other, "question unanswered; continuing with empty answers");
                PermissionResult::Allow {
                    updated_input: with_empty_answers(tool_input),
                }
            }
        }
    }

    /// Evaluate a delivery (commit/push/PR/release) against the policy using
    /// live branch facts.
    pub async fn check_delivery(
        &self,
        operation: OperationKind,
        preflight: &Preflight,
        force: bool,
    ) -> PolicyDecision {
        let request = delivery_request(operation, preflight, force);
        let decision = self.inner.policy.read().await.evaluate_git(&request);
        info!(%operation, branch = %preflight.branch, behavior = %decision.behavior, "delivery decision");
        decision
    }

    /// Start a session in the background and return its id immediately.
    #[instrument(skip_all)]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<String> {
        let runtime = self
            .inner
            .runtime
            .clone()
            .ok_or_else(|| anyhow!("no agent runtime configured (set agent.command)"))?;
        if request.prompt.trim().is_empty() {
            return Err(anyhow!("prompt must not be empty"));
        }
        let session_id = request
            .session_id
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
        let workdir = request
            .working_directory
            .unwrap_or_else(|| self.inner.workdir.clone());
        let cancel = CancellationToken::new();

        {
            let mut sessions = self.inner.sessions.write().await;
            if sessions
                .get(&session_id)
                .is_some_and(|e| e.session.status == SessionStatus::Running)
            {
                return Err(anyhow!("session {session_id} is already running"));
            }
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    session: Session {
                        id: session_id.clone(),
                        status: SessionStatus::Running,
                        prompt: request.prompt.clone(),
                        working_directory: workdir.clone(),
                        started_at: Utc::now(),
                        completed_at: None,
                        error: None,
                        messages: vec![AgentMessage::new(MessageRole::User, &request.prompt)],
                    },
                    cancel: cancel.clone(),
                },
            );
        }
        info!(session_id = %session_id, "session started");

        let ctx = RunContext {
            session_id: session_id.clone(),
            prompt: request.prompt,
            workdir,
            gate: self.gate(&session_id),
            cancel: cancel.clone(),
        };
        let coordinator = self.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = runtime.run(ctx) => result,
                _ = cancel.cancelled() => Ok(()),
            };
            coordinator.finish_session(&id, result).await;
        });
        Ok(session_id)
    }

    async fn finish_session(&self, session_id: &str, result: Result<()>) {
        let message = {
            let mut sessions = self.inner.sessions.write().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            if entry.session.status != SessionStatus::Running {
                return;
            }
            let (status, text) = match result {
                Ok(()) => (SessionStatus::Completed, "execution completed".to_string()),
                Err(err) => {
                    warn!(session_id, err = %format!("{err:#}"), "session failed");
                    entry.session.error = Some(format!("{err:#}"));
                    (SessionStatus::Failed, format!("execution failed: {err:#}"))
                }
            };
            entry.session.status = status;
            entry.session.completed_at = Some(Utc::now());
            let message = AgentMessage::new(MessageRole::System, text);
            entry.session.messages.push(message.clone());
            info!(session_id, status = ?status, "session finished");
            message
        };
        self.publish_message(session_id, message).await;
    }

    /// Cancel a running session and reject its pending approvals.
    pub async fn interrupt(&self, session_id: &str) -> bool {
        let message = {
            let mut sessions = self.inner.sessions.write().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return false;
            };
            if entry.session.status != SessionStatus::Running {
                return false;
            }
            entry.cancel.cancel();
            entry.session.status = SessionStatus::Interrupted;
            entry.session.completed_at = Some(Utc::now());
            let message = AgentMessage::new(MessageRole::System, "execution interrupted by user");
            entry.session.messages.push(message.clone());
            message
        };
        let cancelled = self.inner.broker.cancel_session(session_id).await;
        info!(session_id, cancelled, "session interrupted");
        self.publish_message(session_id, message).await;
        true
    }

    async fn record_message(&self, session_id: &str, message: AgentMessage) {
        {
            let mut sessions = self.inner.sessions.write().await;
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.session.messages.push(message.clone());
            }
        }
        self.publish_message(session_id, message).await;
    }

    async fn publish_message(&self, session_id: &str, message: AgentMessage) {
        self.inner
            .broker
            .publish(
                session_id,
                ServerMessage::AgentMessage {
                    session_id: session_id.to_string(),
                    message,
                },
            )
            .await;
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|entry| SessionSummary {
                id: entry.session.id.clone(),
                status: entry.session.status,
                prompt: entry.session.prompt.clone(),
                started_at: entry.session.started_at,
                completed_at: entry.session.completed_at,
                message_count: entry.session.messages.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    pub async fn pending_approvals(&self, session_id: &str) -> Vec<PendingSummary> {
        self.inner.broker.pending_for_session(session_id).await
    }

    /// Drop finished sessions that ended more than `max_age` before `now`.
    pub async fn cleanup_sessions(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.inner.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| match entry.session.completed_at {
            Some(done) => entry.session.status == SessionStatus::Running || now - done <= max_age,
            None => true,
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "cleaned up finished sessions");
        }
        removed
    }
}

/// Classification and policy verdict for one tool call, before any approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolEvaluation {
    pub category: PathCategory,
    pub operation: OperationKind,
    pub known_tool: bool,
    pub decision: PolicyDecision,
}

/// Classify a tool call and evaluate it against `engine`.
///
/// Git operations read `branch`, `is_main_branch` and `force` from the
/// input. Unrecognised tools are evaluated as reads, escalated to `ask` when
/// the config says so.
pub fn evaluate_tool(engine: &PolicyEngine, tool_name: &str, tool_input: &Value) -> ToolEvaluation {
    let category = classify_path(target_path(tool_input));
    let operation = classify_operation(tool_name);
    let known_tool = is_known_tool(tool_name);
    if !known_tool {
        warn!(tool = tool_name, "unrecognised tool classified as tool_read");
    }

    let mut decision = if operation.is_git() {
        engine.evaluate_git(&git_request(operation, tool_input))
    } else {
        engine.evaluate(category, operation)
    };
    if !known_tool
        && engine.config().unknown_tools == UnknownToolPolicy::Ask
        && decision.behavior == PolicyBehavior::Allow
    {
        decision.behavior = PolicyBehavior::Ask;
        decision.reason = Some(format!("unrecognised tool {tool_name} requires approval"));
    }
    ToolEvaluation {
        category,
        operation,
        known_tool,
        decision,
    }
}

/// Git request for a delivery, using live branch facts. A push that would
/// need a force push is evaluated as one.
pub fn delivery_request(operation: OperationKind, preflight: &Preflight, force: bool) -> GitRequest {
    GitRequest {
        operation,
        branch: Some(preflight.branch.clone()),
        is_main_branch: preflight.is_main_branch,
        force: force || (operation == OperationKind::GitPush && preflight.requires_force_push),
    }
}

fn target_path(input: &Value) -> Option<&str> {
    PATH_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
}

fn git_request(operation: OperationKind, input: &Value) -> GitRequest {
    GitRequest {
        operation,
        branch: input
            .get("branch")
            .and_then(Value::as_str)
            .map(str::to_string),
        is_main_branch: input
            .get("is_main_branch")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        force: input.get("force").and_then(Value::as_bool).unwrap_or(false),
    }
}

fn with_empty_answers(input: Value) -> Value {
    let mut map = match input {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("answers".to_string(), Value::Object(Map::new()));
    Value::Object(map)
}

fn permission_from_outcome(tool_name: &str, outcome: ApprovalOutcome) -> PermissionResult {
    match outcome {
        ApprovalOutcome::Approved { updated_input } => PermissionResult::Allow { updated_input },
        ApprovalOutcome::Denied { reason } => PermissionResult::Deny {
            message: reason.unwrap_or_else(|| "user denied tool execution".to_string()),
        },
        ApprovalOutcome::TimedOut => PermissionResult::Deny {
            message: format!("approval for {tool_name} timed out"),
        },
        ApprovalOutcome::NoListener => PermissionResult::Deny {
            message: format!("{tool_name} requires approval but no approval listener is connected"),
        },
        ApprovalOutcome::Cancelled => PermissionResult::Deny {
            message: "session was interrupted".to_string(),
        },
    }
}

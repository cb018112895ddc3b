//! Test-only fixtures: scripted agent runtimes, coordinators and ledgers.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};

use crate::approval::ApprovalBroker;
use crate::coordinator::{AgentRuntime, Coordinator, PermissionResult, RunContext};
use crate::core::policy::{PolicyConfig, PolicyEngine, PolicyPreset};
use crate::io::config::ApprovalConfig;
use crate::protocol::{AgentMessage, MessageRole, ServerMessage, ToolApprovalRequest};

/// One action a [`ScriptedRuntime`] performs, in order.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Emit an assistant message.
    Say(String),
    /// Ask permission for a tool call and record the verdict.
    Tool(String, Value),
}

/// Agent runtime that replays a fixed script against the session gate.
#[derive(Clone)]
pub struct ScriptedRuntime {
    steps: Arc<Vec<ScriptedStep>>,
    verdicts: Arc<Mutex<Vec<PermissionResult>>>,
    finished: Arc<Notify>,
}

impl ScriptedRuntime {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Arc::new(steps),
            verdicts: Arc::new(Mutex::new(Vec::new())),
            finished: Arc::new(Notify::new()),
        }
    }

    /// Wait until the script has run to its end.
    pub async fn wait_finished(&self) {
        self.finished.notified().await;
    }

    pub async fn verdicts(&self) -> Vec<PermissionResult> {
        self.verdicts.lock().await.clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run(&self, ctx: RunContext) -> Result<()> {
        for step in &*self.steps {
            match step {
                ScriptedStep::Say(text) => {
                    ctx.gate
                        .emit(AgentMessage::new(MessageRole::Assistant, text.clone()))
                        .await;
                }
                ScriptedStep::Tool(name, input) => {
                    let verdict = ctx.gate.check_permission(name, input.clone()).await;
                    self.verdicts.lock().await.push(verdict);
                }
            }
        }
        self.finished.notify_one();
        Ok(())
    }
}

/// Coordinator over a fresh broker and a `preset` policy, rooted at `.`.
pub fn coordinator_with(preset: PolicyPreset, runtime: Option<ScriptedRuntime>) -> Coordinator {
    let engine = PolicyEngine::new(PolicyConfig::with_preset(preset)).expect("preset policy");
    Coordinator::new(
        Arc::new(RwLock::new(engine)),
        Arc::new(ApprovalBroker::new()),
        ApprovalConfig::default(),
        ".",
        runtime.map(|r| Arc::new(r) as Arc<dyn AgentRuntime>),
    )
}

/// Receive until the next tool approval request, skipping other messages.
pub async fn next_approval(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ToolApprovalRequest {
    let wait = async {
        while let Some(message) = rx.recv().await {
            if let ServerMessage::ToolApprovalRequest(request) = message {
                return request;
            }
        }
        panic!("listener channel closed before an approval request arrived");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("approval request within 5s")
}

/// Temporary project whose root `Plans.md` holds `ledger`.
pub fn project_with_ledger(ledger: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("Plans.md"), ledger).expect("write ledger");
    temp
}

/// Two-agent ledger covering every active column.
pub const TWO_AGENT_LEDGER: &str = "\
# Plans

## Plan
- [ ] Login form `pm:依頼中`
- [ ] Password reset `cc:TODO`

## Work
- [ ] Search index `cc:WIP`

## Review
- [ ] Profile page `cc:完了`
";

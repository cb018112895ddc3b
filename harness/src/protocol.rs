//! Messages exchanged with approval listeners.
//!
//! Both directions are closed tagged enums keyed by `type`; anything that does
//! not deserialize into [`ClientMessage`] is rejected at the socket boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{OperationKind, PathCategory};

/// Listener verdict for a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Allow,
    Deny,
    /// Allow with `modified_input` replacing the original tool input.
    Modify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub session_id: String,
    pub tool_use_id: String,
    pub decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn allow(session_id: &str, tool_use_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            decision: DecisionKind::Allow,
            modified_input: None,
            reason: None,
        }
    }

    pub fn deny(session_id: &str, tool_use_id: &str, reason: Option<&str>) -> Self {
        Self {
            decision: DecisionKind::Deny,
            reason: reason.map(str::to_string),
            ..Self::allow(session_id, tool_use_id)
        }
    }

    pub fn modify(session_id: &str, tool_use_id: &str, modified_input: Value) -> Self {
        Self {
            decision: DecisionKind::Modify,
            modified_input: Some(modified_input),
            ..Self::allow(session_id, tool_use_id)
        }
    }
}

/// Inbound listener messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterSession { session_id: String },
    ToolApprovalResponse(ApprovalDecision),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApprovalRequest {
    pub session_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub is_protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_reason: Option<String>,
    pub policy_category: PathCategory,
    pub policy_operation: OperationKind,
}

/// Outbound listener messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        session_id: String,
    },
    ToolApprovalRequest(ToolApprovalRequest),
    AskUserQuestion {
        session_id: String,
        tool_use_id: String,
        questions: Value,
    },
    AgentMessage {
        session_id: String,
        message: AgentMessage,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

//! Approval broker: pairs permission requests with asynchronous human
//! decisions.
//!
//! Each pending approval is keyed by `tool_use_id` and owns a oneshot
//! responder. Whoever removes the entry from the pending map (a decision,
//! the timeout, or a session cancel) is the only party that can resolve it,
//! so every request resolves exactly once. Both maps are process-local; a
//! restart drops all in-flight approvals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{OperationKind, PathCategory};
use crate::protocol::{ApprovalDecision, DecisionKind, ServerMessage, ToolApprovalRequest};

/// Channel a listener (UI socket) receives broker messages on.
pub type ListenerTx = mpsc::UnboundedSender<ServerMessage>;

/// Identifies one listener registration, so a stale socket cannot remove a
/// newer registration for the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// What the listener is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Tool {
        is_protected: bool,
        protected_reason: Option<String>,
        category: PathCategory,
        operation: OperationKind,
    },
    Question {
        questions: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub kind: RequestKind,
}

impl ApprovalRequest {
    fn to_message(&self) -> ServerMessage {
        match &self.kind {
            RequestKind::Tool {
                is_protected,
                protected_reason,
                category,
                operation,
            } => ServerMessage::ToolApprovalRequest(ToolApprovalRequest {
                session_id: self.session_id.clone(),
                tool_use_id: self.tool_use_id.clone(),
                tool_name: self.tool_name.clone(),
                tool_input: self.tool_input.clone(),
                is_protected: *is_protected,
                protected_reason: protected_reason.clone(),
                policy_category: *category,
                policy_operation: *operation,
            }),
            RequestKind::Question { questions } => ServerMessage::AskUserQuestion {
                session_id: self.session_id.clone(),
                tool_use_id: self.tool_use_id.clone(),
                questions: questions.clone(),
            },
        }
    }
}

/// How a request ended. Everything except `Approved` must be treated as a
/// refusal by tool callers.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    /// Allowed, with the input to run (modified or original).
    Approved { updated_input: Value },
    Denied { reason: Option<String> },
    TimedOut,
    /// No live listener for the session; nothing was published.
    NoListener,
    /// The session was interrupted while waiting.
    Cancelled,
}

#[derive(Debug)]
enum Resolution {
    Decided(ApprovalDecision),
    Cancelled,
}

#[derive(Debug)]
struct PendingApproval {
    session_id: String,
    tool_name: String,
    tool_input: Value,
    requested_at: DateTime<Utc>,
    responder: oneshot::Sender<Resolution>,
}

/// Read-only view of a pending approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSummary {
    pub session_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Listener {
    id: ListenerId,
    tx: ListenerTx,
}

#[derive(Debug, Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, PendingApproval>>,
    listeners: RwLock<HashMap<String, Listener>>,
    next_listener: AtomicU64,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `session_id` to `tx`, replacing any previous
    /// registration.
    pub async fn register_listener(&self, session_id: &str, tx: ListenerTx) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .await
            .insert(session_id.to_string(), Listener { id, tx });
        info!(session_id, "approval listener registered");
        id
    }

    /// Remove the registration if it is still `id`.
    pub async fn unregister_listener(&self, session_id: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        if listeners.get(session_id).is_some_and(|l| l.id == id) {
            listeners.remove(session_id);
            info!(session_id, "approval listener unregistered");
            return true;
        }
        false
    }

    pub async fn has_listener(&self, session_id: &str) -> bool {
        self.listeners
            .read()
            .await
            .get(session_id)
            .is_some_and(|l| !l.tx.is_closed())
    }

    /// Deliver a message to the session's listener. Returns false (and drops
    /// the registration) if the listener is gone.
    pub async fn publish(&self, session_id: &str, message: ServerMessage) -> bool {
        let delivered = match self.listeners.read().await.get(session_id) {
            Some(listener) => listener.tx.send(message).is_ok(),
            None => return false,
        };
        if !delivered {
            warn!(session_id, "listener channel closed");
            self.listeners.write().await.remove(session_id);
        }
        delivered
    }

    /// Publish `request` and wait for a decision, a timeout or a cancel.
    ///
    /// Fails closed: without a live listener this returns
    /// [`ApprovalOutcome::NoListener`] immediately.
    #[instrument(skip_all, fields(session_id = %request.session_id, tool_use_id = %request.tool_use_id, tool = %request.tool_name))]
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> ApprovalOutcome {
        if !self.has_listener(&request.session_id).await {
            warn!("no approval listener; failing closed");
            return ApprovalOutcome::NoListener;
        }

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&request.tool_use_id) {
                warn!("duplicate tool_use_id already pending");
                return ApprovalOutcome::Denied {
                    reason: Some(format!(
                        "approval {} is already pending",
                        request.tool_use_id
                    )),
                };
            }
            pending.insert(
                request.tool_use_id.clone(),
                PendingApproval {
                    session_id: request.session_id.clone(),
                    tool_name: request.tool_name.clone(),
                    tool_input: request.tool_input.clone(),
                    requested_at: Utc::now(),
                    responder: tx,
                },
            );
        }

        // Removes the entry if this future is dropped before it resolves.
        let mut guard = PendingGuard {
            pending: &self.pending,
            tool_use_id: &request.tool_use_id,
            armed: true,
        };

        if !self
            .publish(&request.session_id, request.to_message())
            .await
        {
            warn!("listener vanished before publish; failing closed");
            return ApprovalOutcome::NoListener;
        }
        debug!(timeout_secs = timeout.as_secs(), "awaiting decision");

        let waited = tokio::time::timeout(timeout, &mut rx).await;
        guard.armed = false;
        let resolution = match waited {
            Ok(received) => received.ok(),
            Err(_) => {
                let removed = self.lock_pending().remove(&request.tool_use_id);
                if removed.is_some() {
                    warn!("approval timed out");
                    return ApprovalOutcome::TimedOut;
                }
                // A resolver removed the entry first; its value is in flight.
                rx.await.ok()
            }
        };
        let resolution = match resolution {
            Some(resolution) => resolution,
            None => return ApprovalOutcome::Cancelled,
        };

        match resolution {
            Resolution::Cancelled => {
                info!("approval cancelled with session");
                ApprovalOutcome::Cancelled
            }
            Resolution::Decided(decision) => {
                info!(decision = ?decision.decision, "approval decided");
                outcome_from_decision(decision, request.tool_input)
            }
        }
    }

    /// Resolve the pending approval for `decision.tool_use_id`.
    ///
    /// Returns true only if this call resolved it; unknown, already resolved,
    /// timed out or session-mismatched ids return false and change nothing.
    #[instrument(skip_all, fields(session_id = %decision.session_id, tool_use_id = %decision.tool_use_id))]
    pub async fn submit_decision(&self, decision: ApprovalDecision) -> bool {
        let entry = {
            let mut pending = self.lock_pending();
            match pending.get(&decision.tool_use_id) {
                Some(entry) if entry.session_id == decision.session_id => {
                    pending.remove(&decision.tool_use_id)
                }
                Some(_) => {
                    warn!("decision session does not match pending approval");
                    return false;
                }
                None => {
                    debug!("no pending approval for decision");
                    return false;
                }
            }
        };
        match entry {
            Some(entry) => entry.responder.send(Resolution::Decided(decision)).is_ok(),
            None => false,
        }
    }

    /// Reject every pending approval for `session_id`. Returns how many were
    /// cancelled.
    pub async fn cancel_session(&self, session_id: &str) -> usize {
        let cancelled: Vec<PendingApproval> = {
            let mut pending = self.lock_pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = cancelled.len();
        for entry in cancelled {
            let _ = entry.responder.send(Resolution::Cancelled);
        }
        if count > 0 {
            info!(session_id, count, "cancelled pending approvals");
        }
        count
    }

    pub async fn pending_for_session(&self, session_id: &str) -> Vec<PendingSummary> {
        let pending = self.lock_pending();
        let mut summaries: Vec<PendingSummary> = pending
            .iter()
            .filter(|(_, entry)| entry.session_id == session_id)
            .map(|(tool_use_id, entry)| PendingSummary {
                session_id: entry.session_id.clone(),
                tool_use_id: tool_use_id.clone(),
                tool_name: entry.tool_name.clone(),
                tool_input: entry.tool_input.clone(),
                requested_at: entry.requested_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.requested_at);
        summaries
    }

    pub async fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingApproval>> {
        lock_map(&self.pending)
    }
}

fn lock_map(
    pending: &Mutex<HashMap<String, PendingApproval>>,
) -> MutexGuard<'_, HashMap<String, PendingApproval>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingApproval>>,
    tool_use_id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && lock_map(self.pending).remove(self.tool_use_id).is_some() {
            debug!(tool_use_id = self.tool_use_id, "approval wait abandoned; pending entry removed");
        }
    }
}

fn outcome_from_decision(decision: ApprovalDecision, original_input: Value) -> ApprovalOutcome {
    match decision.decision {
        DecisionKind::Allow | DecisionKind::Modify => ApprovalOutcome::Approved {
            updated_input: decision.modified_input.unwrap_or(original_input),
        },
        DecisionKind::Deny => ApprovalOutcome::Denied {
            reason: decision.reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn tool_request(session_id: &str, tool_use_id: &str) -> ApprovalRequest {
        ApprovalRequest {
            session_id: session_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            tool_name: "Write".to_string(),
            tool_input: json!({"file_path": "src/app.ts", "content": "x"}),
            kind: RequestKind::Tool {
                is_protected: false,
                protected_reason: None,
                category: PathCategory::Code,
                operation: OperationKind::ToolWrite,
            },
        }
    }

    async fn with_listener(
        broker: &ApprovalBroker,
        session_id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        broker.register_listener(session_id, tx).await;
        rx
    }

    fn spawn_request(
        broker: &Arc<ApprovalBroker>,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<ApprovalOutcome> {
        let broker = Arc::clone(broker);
        tokio::spawn(async move { broker.request_approval(request, timeout).await })
    }

    #[tokio::test]
    async fn no_listener_fails_closed_immediately() {
        let broker = ApprovalBroker::new();
        let outcome = broker
            .request_approval(tool_request("s1", "t1"), Duration::from_secs(3600))
            .await;
        assert_eq!(outcome, ApprovalOutcome::NoListener);
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn closed_listener_fails_closed() {
        let broker = ApprovalBroker::new();
        let rx = with_listener(&broker, "s1").await;
        drop(rx);
        let outcome = broker
            .request_approval(tool_request("s1", "t1"), Duration::from_secs(3600))
            .await;
        assert_eq!(outcome, ApprovalOutcome::NoListener);
    }

    #[tokio::test]
    async fn allow_returns_original_input() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let handle = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));

        let published = rx.recv().await.expect("published");
        let ServerMessage::ToolApprovalRequest(request) = published else {
            panic!("expected tool approval request, got {published:?}");
        };
        assert_eq!(request.tool_use_id, "t1");
        assert_eq!(request.policy_category, PathCategory::Code);

        assert!(broker.submit_decision(ApprovalDecision::allow("s1", "t1")).await);
        let outcome = handle.await.expect("join");
        assert_eq!(
            outcome,
            ApprovalOutcome::Approved {
                updated_input: json!({"file_path": "src/app.ts", "content": "x"})
            }
        );
    }

    #[tokio::test]
    async fn second_decision_is_a_no_op() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let handle = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        rx.recv().await.expect("published");

        assert!(
            broker
                .submit_decision(ApprovalDecision::deny("s1", "t1", Some("not now")))
                .await
        );
        assert!(!broker.submit_decision(ApprovalDecision::allow("s1", "t1")).await);

        let outcome = handle.await.expect("join");
        assert_eq!(
            outcome,
            ApprovalOutcome::Denied {
                reason: Some("not now".to_string())
            }
        );
    }

    #[tokio::test]
    async fn modify_replaces_input() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let handle = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        rx.recv().await.expect("published");

        let edited = json!({"file_path": "src/app.ts", "content": "y"});
        assert!(
            broker
                .submit_decision(ApprovalDecision::modify("s1", "t1", edited.clone()))
                .await
        );
        assert_eq!(
            handle.await.expect("join"),
            ApprovalOutcome::Approved {
                updated_input: edited
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_and_late_decision_is_ignored() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let handle = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        rx.recv().await.expect("published");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(handle.await.expect("join"), ApprovalOutcome::TimedOut);
        assert!(!broker.submit_decision(ApprovalDecision::allow("s1", "t1")).await);
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn mismatched_session_cannot_resolve() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let handle = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        rx.recv().await.expect("published");

        assert!(!broker.submit_decision(ApprovalDecision::allow("s2", "t1")).await);
        assert_eq!(broker.pending_for_session("s1").await.len(), 1);
        assert!(broker.submit_decision(ApprovalDecision::allow("s1", "t1")).await);
        assert!(matches!(
            handle.await.expect("join"),
            ApprovalOutcome::Approved { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_decision_returns_false() {
        let broker = ApprovalBroker::new();
        assert!(!broker.submit_decision(ApprovalDecision::allow("s1", "nope")).await);
    }

    #[tokio::test]
    async fn cancel_session_rejects_only_that_session() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx1 = with_listener(&broker, "s1").await;
        let mut rx2 = with_listener(&broker, "s2").await;
        let first = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        let second = spawn_request(&broker, tool_request("s2", "t2"), Duration::from_secs(60));
        rx1.recv().await.expect("published s1");
        rx2.recv().await.expect("published s2");

        assert_eq!(broker.cancel_session("s1").await, 1);
        assert_eq!(first.await.expect("join"), ApprovalOutcome::Cancelled);

        assert_eq!(broker.pending_for_session("s2").await.len(), 1);
        assert!(broker.submit_decision(ApprovalDecision::allow("s2", "t2")).await);
        assert!(matches!(
            second.await.expect("join"),
            ApprovalOutcome::Approved { .. }
        ));
    }

    #[tokio::test]
    async fn question_request_publishes_questions() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let request = ApprovalRequest {
            kind: RequestKind::Question {
                questions: json!([{"question": "Which DB?"}]),
            },
            tool_name: "AskUserQuestion".to_string(),
            ..tool_request("s1", "q1")
        };
        let handle = spawn_request(&broker, request, Duration::from_secs(120));

        let published = rx.recv().await.expect("published");
        assert_eq!(
            published,
            ServerMessage::AskUserQuestion {
                session_id: "s1".to_string(),
                tool_use_id: "q1".to_string(),
                questions: json!([{"question": "Which DB?"}]),
            }
        );
        let answers = json!({"answers": {"Which DB?": "Postgres"}});
        broker
            .submit_decision(ApprovalDecision::modify("s1", "q1", answers.clone()))
            .await;
        assert_eq!(
            handle.await.expect("join"),
            ApprovalOutcome::Approved {
                updated_input: answers
            }
        );
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_listener() {
        let broker = ApprovalBroker::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let old = broker.register_listener("s1", old_tx).await;
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let new = broker.register_listener("s1", new_tx).await;

        assert!(!broker.unregister_listener("s1", old).await);
        assert!(broker.has_listener("s1").await);
        assert!(broker.unregister_listener("s1", new).await);
        assert!(!broker.has_listener("s1").await);
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_refused() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let first = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        rx.recv().await.expect("published");

        let second = broker
            .request_approval(tool_request("s1", "t1"), Duration::from_secs(60))
            .await;
        assert!(matches!(second, ApprovalOutcome::Denied { .. }));

        assert!(broker.submit_decision(ApprovalDecision::allow("s1", "t1")).await);
        assert!(matches!(
            first.await.expect("join"),
            ApprovalOutcome::Approved { .. }
        ));
    }

    #[tokio::test]
    async fn dropped_wait_removes_pending_entry() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut rx = with_listener(&broker, "s1").await;
        let waiting = spawn_request(&broker, tool_request("s1", "t1"), Duration::from_secs(60));
        rx.recv().await.expect("published");
        assert_eq!(broker.pending_count().await, 1);

        waiting.abort();
        assert!(waiting.await.expect_err("aborted").is_cancelled());

        assert_eq!(broker.pending_count().await, 0);
        assert!(!broker.submit_decision(ApprovalDecision::allow("s1", "t1")).await);
    }
}

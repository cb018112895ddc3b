//! End-to-end permission flows through the coordinator and approval broker.
//!
//! Each test plays the UI listener side of the approval channel: it registers
//! for a session, receives `tool_approval_request` messages and answers them,
//! while the coordinator plays the agent side.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use harness::coordinator::{Coordinator, ExecuteRequest, PermissionResult, SessionStatus};
use harness::core::policy::PolicyPreset;
use harness::core::types::{OperationKind, PathCategory};
use harness::protocol::{ApprovalDecision, ServerMessage};
use harness::test_support::{ScriptedRuntime, ScriptedStep, coordinator_with, next_approval};

fn spawn_check(
    coordinator: &Coordinator,
    session_id: &str,
    tool: &str,
    input: serde_json::Value,
) -> tokio::task::JoinHandle<PermissionResult> {
    let coordinator = coordinator.clone();
    let session_id = session_id.to_string();
    let tool = tool.to_string();
    tokio::spawn(async move { coordinator.check_permission(&session_id, &tool, input).await })
}

/// Balanced preset: a code write is held for approval and, once allowed,
/// proceeds with the original input.
#[tokio::test]
async fn balanced_code_write_waits_for_approval() {
    let coordinator = coordinator_with(PolicyPreset::Balanced, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.broker().register_listener("s1", tx).await;

    let input = json!({"file_path": "src/app.ts", "content": "export {}"});
    let task = spawn_check(&coordinator, "s1", "Write", input.clone());

    let request = next_approval(&mut rx).await;
    assert_eq!(request.tool_name, "Write");
    assert_eq!(request.policy_category, PathCategory::Code);
    assert_eq!(request.policy_operation, OperationKind::ToolWrite);
    assert!(!request.is_protected);
    assert_eq!(request.tool_input, input);

    assert!(
        coordinator
            .broker()
            .submit_decision(ApprovalDecision::allow("s1", &request.tool_use_id))
            .await
    );
    assert_eq!(
        task.await.expect("join"),
        PermissionResult::Allow {
            updated_input: input
        }
    );

    // A second answer for the same request changes nothing.
    assert!(
        !coordinator
            .broker()
            .submit_decision(ApprovalDecision::deny("s1", &request.tool_use_id, None))
            .await
    );
    assert_eq!(coordinator.broker().pending_count().await, 0);
}

/// The ledger is protected under every preset, including fast.
#[tokio::test]
async fn ledger_writes_are_protected_under_balanced_and_fast() {
    for preset in [PolicyPreset::Balanced, PolicyPreset::Fast] {
        let coordinator = coordinator_with(preset, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.broker().register_listener("s1", tx).await;

        let task = spawn_check(&coordinator, "s1", "Write", json!({"file_path": "Plans.md"}));
        let request = next_approval(&mut rx).await;
        assert!(request.is_protected, "{preset:?}");
        assert_eq!(request.policy_category, PathCategory::Protected);

        let modified = json!({"file_path": "Plans.md", "content": "- [ ] reviewed"});
        coordinator
            .broker()
            .submit_decision(ApprovalDecision::modify(
                "s1",
                &request.tool_use_id,
                modified.clone(),
            ))
            .await;
        assert_eq!(
            task.await.expect("join"),
            PermissionResult::Allow {
                updated_input: modified
            }
        );
    }
}

/// An unanswered request is denied once the tool timeout elapses.
#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_as_deny() {
    let coordinator = coordinator_with(PolicyPreset::Strict, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.broker().register_listener("s1", tx).await;

    let task = spawn_check(&coordinator, "s1", "Bash", json!({"command": "make"}));
    let request = next_approval(&mut rx).await;

    let result = task.await.expect("join");
    assert_eq!(
        result,
        PermissionResult::Deny {
            message: "approval for Bash timed out".to_string()
        }
    );
    assert!(
        !coordinator
            .broker()
            .submit_decision(ApprovalDecision::allow("s1", &request.tool_use_id))
            .await
    );
}

/// Decisions for another session's request are refused.
#[tokio::test]
async fn decision_from_other_session_is_ignored() {
    let coordinator = coordinator_with(PolicyPreset::Balanced, None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.broker().register_listener("s1", tx).await;

    let task = spawn_check(&coordinator, "s1", "Edit", json!({"file_path": "lib/util.py"}));
    let request = next_approval(&mut rx).await;

    assert!(
        !coordinator
            .broker()
            .submit_decision(ApprovalDecision::allow("s2", &request.tool_use_id))
            .await
    );
    coordinator
        .broker()
        .submit_decision(ApprovalDecision::deny(
            "s1",
            &request.tool_use_id,
            Some("not now"),
        ))
        .await;
    assert_eq!(
        task.await.expect("join"),
        PermissionResult::Deny {
            message: "not now".to_string()
        }
    );
}

/// A scripted agent session: read is allowed silently, a code write waits
/// for the listener, and the transcript reaches the listener.
#[tokio::test]
async fn scripted_session_mixes_allowed_and_approved_tools() {
    let runtime = ScriptedRuntime::new(vec![
        ScriptedStep::Tool("Read".to_string(), json!({"file_path": "src/app.ts"})),
        ScriptedStep::Say("updating app".to_string()),
        ScriptedStep::Tool(
            "Write".to_string(),
            json!({"file_path": "src/app.ts", "content": "x"}),
        ),
    ]);
    let coordinator = coordinator_with(PolicyPreset::Balanced, Some(runtime.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    coordinator.broker().register_listener("s1", tx).await;

    coordinator
        .execute(ExecuteRequest {
            prompt: "update the app".to_string(),
            session_id: Some("s1".to_string()),
            working_directory: None,
        })
        .await
        .expect("execute");

    let mut saw_message = false;
    let request = loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message within 5s")
            .expect("channel open")
        {
            ServerMessage::AgentMessage { message, .. } if message.content == "updating app" => {
                saw_message = true;
            }
            ServerMessage::ToolApprovalRequest(request) => break request,
            _ => {}
        }
    };
    assert!(saw_message);
    coordinator
        .broker()
        .submit_decision(ApprovalDecision::allow("s1", &request.tool_use_id))
        .await;

    runtime.wait_finished().await;
    let verdicts = runtime.verdicts().await;
    assert_eq!(verdicts.len(), 2);
    assert!(verdicts.iter().all(PermissionResult::is_allow));

    for _ in 0..200 {
        let session = coordinator.get_session("s1").await.expect("session");
        if session.status == SessionStatus::Completed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session did not complete");
}

//! Two-agent handoff state machine for ledger markers.
//!
//! Solo mode has no restrictions. In two-agent mode each known marker has a
//! fixed set of successors and a fixed set of roles allowed to move it.
//! Markers missing from the graph pass unchecked.

use serde::Serialize;

use crate::core::types::{ActorRole, WorkflowMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: &'static str,
    pub next: &'static [&'static str],
    pub actors: &'static [ActorRole],
}

const fn edge(
    from: &'static str,
    next: &'static [&'static str],
    actors: &'static [ActorRole],
) -> TransitionRule {
    TransitionRule { from, next, actors }
}

pub const TWO_AGENT_GRAPH: &[TransitionRule] = &[
    edge("pm:依頼中", &["cc:WIP"], &[ActorRole::Impl]),
    edge("cc:WIP", &["cc:完了", "cc:blocked"], &[ActorRole::Impl]),
    edge("cc:完了", &["pm:確認済", "pm:要修正"], &[ActorRole::Pm]),
    edge(
        "cc:blocked",
        &["cc:WIP", "pm:キャンセル"],
        &[ActorRole::Impl, ActorRole::Pm],
    ),
    edge("pm:要修正", &["cc:WIP"], &[ActorRole::Impl]),
    edge("pm:確認済", &[], &[]),
    edge("pm:キャンセル", &[], &[]),
];

pub fn rule_for(marker: &str) -> Option<&'static TransitionRule> {
    TWO_AGENT_GRAPH.iter().find(|rule| rule.from == marker)
}

/// Why a two-agent transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionViolation {
    /// The target marker is not a successor of the current one.
    InvalidTarget { allowed: Vec<String> },
    /// The edge exists but this role may not take it.
    ActorNotPermitted {
        actor: ActorRole,
        allowed_actors: Vec<ActorRole>,
    },
}

impl TransitionViolation {
    pub fn describe(&self, old_marker: &str, new_marker: &str) -> String {
        match self {
            TransitionViolation::InvalidTarget { allowed } if allowed.is_empty() => format!(
                "invalid transition {old_marker} -> {new_marker}: {old_marker} is terminal"
            ),
            TransitionViolation::InvalidTarget { allowed } => format!(
                "invalid transition {old_marker} -> {new_marker}; allowed next markers: {}",
                allowed.join(", ")
            ),
            TransitionViolation::ActorNotPermitted {
                actor,
                allowed_actors,
            } => {
                let roles: Vec<&str> = allowed_actors.iter().map(|r| r.as_str()).collect();
                format!(
                    "{actor} may not perform {old_marker} -> {new_marker}; allowed roles: {}",
                    roles.join(", ")
                )
            }
        }
    }
}

/// Check a marker change. The caller has already enforced that two-agent
/// requests carry an actor.
pub fn validate_transition(
    old_marker: &str,
    new_marker: &str,
    mode: WorkflowMode,
    actor: ActorRole,
) -> Result<(), TransitionViolation> {
    if mode == WorkflowMode::Solo {
        return Ok(());
    }
    let Some(rule) = rule_for(old_marker) else {
        return Ok(());
    };
    if !rule.next.contains(&new_marker) {
        return Err(TransitionViolation::InvalidTarget {
            allowed: rule.next.iter().map(|m| m.to_string()).collect(),
        });
    }
    if !rule.actors.contains(&actor) {
        return Err(TransitionViolation::ActorNotPermitted {
            actor,
            allowed_actors: rule.actors.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO: WorkflowMode = WorkflowMode::TwoAgent;

    #[test]
    fn request_pickup_is_impl_only() {
        let err = validate_transition("pm:依頼中", "cc:WIP", TWO, ActorRole::Pm)
            .expect_err("pm cannot pick up");
        assert_eq!(
            err,
            TransitionViolation::ActorNotPermitted {
                actor: ActorRole::Pm,
                allowed_actors: vec![ActorRole::Impl],
            }
        );
        assert!(validate_transition("pm:依頼中", "cc:WIP", TWO, ActorRole::Impl).is_ok());
    }

    #[test]
    fn invalid_target_lists_allowed() {
        let err = validate_transition("cc:WIP", "pm:確認済", TWO, ActorRole::Pm)
            .expect_err("skip review");
        assert_eq!(
            err,
            TransitionViolation::InvalidTarget {
                allowed: vec!["cc:完了".to_string(), "cc:blocked".to_string()],
            }
        );
        assert!(err.describe("cc:WIP", "pm:確認済").contains("cc:完了, cc:blocked"));
    }

    /// Target legality is checked before the actor.
    #[test]
    fn invalid_target_reported_before_actor() {
        let err = validate_transition("cc:完了", "cc:WIP", TWO, ActorRole::Impl)
            .expect_err("invalid");
        assert!(matches!(err, TransitionViolation::InvalidTarget { .. }));
    }

    #[test]
    fn terminal_markers_have_no_exit() {
        for terminal in ["pm:確認済", "pm:キャンセル"] {
            let err = validate_transition(terminal, "cc:WIP", TWO, ActorRole::Pm)
                .expect_err("terminal");
            assert_eq!(err, TransitionViolation::InvalidTarget { allowed: vec![] });
            assert!(err.describe(terminal, "cc:WIP").contains("terminal"));
        }
    }

    #[test]
    fn blocked_accepts_either_role() {
        assert!(validate_transition("cc:blocked", "cc:WIP", TWO, ActorRole::Impl).is_ok());
        assert!(validate_transition("cc:blocked", "pm:キャンセル", TWO, ActorRole::Pm).is_ok());
    }

    #[test]
    fn review_round_trip() {
        assert!(validate_transition("cc:WIP", "cc:完了", TWO, ActorRole::Impl).is_ok());
        assert!(validate_transition("cc:完了", "pm:要修正", TWO, ActorRole::Pm).is_ok());
        assert!(validate_transition("pm:要修正", "cc:WIP", TWO, ActorRole::Impl).is_ok());
        assert!(validate_transition("cc:完了", "pm:確認済", TWO, ActorRole::Pm).is_ok());
    }

    #[test]
    fn unknown_marker_passes() {
        assert!(validate_transition("cc:TODO", "cc:WIP", TWO, ActorRole::Pm).is_ok());
    }

    #[test]
    fn solo_mode_is_unrestricted() {
        assert!(
            validate_transition("pm:確認済", "cc:TODO", WorkflowMode::Solo, ActorRole::Pm).is_ok()
        );
    }
}

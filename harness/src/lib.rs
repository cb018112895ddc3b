//! Guardrail and approval harness for coding agents.
//!
//! Every file or git operation an agent attempts is classified, evaluated
//! against a layered policy and, when the policy says `ask`, held until a
//! human answers. A markdown task ledger tracks the work itself, with a
//! two-agent marker workflow guarded by optimistic concurrency.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, policy
//!   evaluation, ledger parsing, marker transitions). No I/O.
//! - **[`io`]**: Side-effecting operations (config and ledger files, git
//!   inspection, agent processes).
//!
//! [`approval`] and [`coordinator`] hold the async session state that ties
//! the two together; [`tasks`] exposes the guarded ledger operations.

pub mod approval;
pub mod coordinator;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod tasks;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

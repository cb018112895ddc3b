//! Stable exit codes for harness CLI commands.

/// Command succeeded, or the evaluated operation is allowed.
pub const OK: i32 = 0;
/// Invalid input, config or ledger, or any other failure.
pub const INVALID: i32 = 1;
/// `harness evaluate` / `harness deliver`: the operation needs approval.
pub const ASK: i32 = 2;
/// `harness evaluate` / `harness deliver`: the operation is denied.
pub const DENY: i32 = 3;
/// `harness mark`: the ledger line changed since it was read.
pub const CONFLICT: i32 = 4;
/// `harness mark`: the transition or actor is not permitted.
pub const REJECTED: i32 = 5;

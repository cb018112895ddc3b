//! Side-effecting adapters: filesystem, git and agent processes.

pub mod agent_process;
pub mod config;
pub mod git;
pub mod init;
pub mod ledger;

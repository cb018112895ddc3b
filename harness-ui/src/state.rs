//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::Arc;

use harness::coordinator::Coordinator;
use harness::core::types::WorkflowMode;
use harness::io::init::HarnessPaths;
use harness::io::ledger::candidate_paths;
use tokio::sync::{Mutex, broadcast};

/// Events broadcast to SSE clients when watched files change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    PlansChanged,
    ConfigChanged,
}

impl ChangeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeEvent::PlansChanged => "plans_changed",
            ChangeEvent::ConfigChanged => "config_changed",
        }
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Root directory of the project (contains the ledger and `.harness/`).
    pub project_dir: PathBuf,
    /// Mode used when a request does not name one.
    pub workflow_mode: WorkflowMode,
    pub coordinator: Coordinator,
    /// Broadcast sender for file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
    /// Serializes read-modify-write of the config file.
    pub config_write: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf, workflow_mode: WorkflowMode, coordinator: Coordinator) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            project_dir,
            workflow_mode,
            coordinator,
            event_tx: Arc::new(event_tx),
            config_write: Arc::new(Mutex::new(())),
        }
    }

    pub fn paths(&self) -> HarnessPaths {
        HarnessPaths::new(&self.project_dir)
    }

    /// Path to `.harness/config.toml`.
    pub fn config_path(&self) -> PathBuf {
        self.paths().config_path
    }

    /// Every location a ledger may live at.
    pub fn ledger_paths(&self) -> [PathBuf; 3] {
        candidate_paths(&self.project_dir)
    }
}

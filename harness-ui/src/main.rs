//! Harness UI server: ledger board, policy settings and the approval channel.

mod routes;
mod sse;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use harness::approval::ApprovalBroker;
use harness::coordinator::{AgentRuntime, Coordinator};
use harness::core::policy::PolicyEngine;
use harness::io::agent_process::ProcessRuntime;
use harness::io::config::load_config;
use harness::io::init::HarnessPaths;
use harness::logging;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

/// Finished sessions are kept this long for the UI to inspect.
const SESSION_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Parser)]
#[command(name = "harness-ui")]
#[command(about = "Web UI for the harness ledger, policy and approvals")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Project directory (contains Plans.md and .harness/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Directory containing UI static files (defaults to ./ui/dist in the project)
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("harness_ui=info,harness=info");

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting harness-ui");

    let config = load_config(&HarnessPaths::new(&project_dir).config_path)?;
    let engine = PolicyEngine::new(config.policy.clone())?;
    let runtime = ProcessRuntime::from_command(&config.agent.command)
        .map(|runtime| Arc::new(runtime) as Arc<dyn AgentRuntime>);
    if runtime.is_none() {
        info!("agent.command not set; sessions cannot be started");
    }
    let coordinator = Coordinator::new(
        Arc::new(RwLock::new(engine)),
        Arc::new(ApprovalBroker::new()),
        config.approval.clone(),
        project_dir.clone(),
        runtime,
    );

    let state = AppState::new(project_dir.clone(), config.ledger.workflow_mode, coordinator);

    sse::start_file_watcher(state.clone());
    start_session_cleanup(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state);

    let ui_dir = args
        .ui_dir
        .unwrap_or_else(|| project_dir.join("ui").join("dist"));

    if ui_dir.exists() {
        info!(ui_dir = %ui_dir.display(), "serving static UI files");
        app = app.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
    } else {
        info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn start_session_cleanup(state: AppState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            state
                .coordinator
                .cleanup_sessions(SESSION_MAX_AGE, chrono::Utc::now())
                .await;
        }
    });
}

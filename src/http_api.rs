use crate::config::Config;
use crate::energy_ledger::{ReportSnapshot, SharedLedger};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_derive::Deserialize;
use std::sync::Arc;
use std::process::Stdio;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub ledger: SharedLedger,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPower {
    current_power: f64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/power/get", get(get_power))
        .route("/power/set", post(set_power))
        .route("/config/get", get(get_config))
        .route("/log/get", get(get_logs))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Serves until `shutdown` is cancelled, then stops accepting and drains.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn get_power(State(state): State<AppState>) -> Json<ReportSnapshot> {
    Json(state.ledger.snapshot())
}

async fn set_power(
    State(state): State<AppState>,
    Json(body): Json<SetPower>,
) -> Result<Json<ReportSnapshot>, (StatusCode, String)> {
    if !body.current_power.is_finite() {
        return Err((
            StatusCode::BAD_REQUEST,
            "currentPower must be a finite number".to_string(),
        ));
    }
    info!(energy = body.current_power, "Power baseline set");
    Ok(Json(state.ledger.rebase(body.current_power)))
}

async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.redacted())
}

async fn get_logs(State(state): State<AppState>) -> Response {
    if !cfg!(target_os = "linux") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Not supported.").into_response();
    }
    match read_log(&state.config.log_command).await {
        Ok(output) => {
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], output).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Could not read the service log");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}

/// Runs the log command and returns stdout followed by stderr. The exit
/// status is ignored.
async fn read_log(command: &[String]) -> Result<Vec<u8>, String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| "log command is empty".to_string())?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to start `{program}`: {e}"))?;
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Ok(combined)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    debug!(%method, %uri, status = %response.status(), elapsed = ?started.elapsed(), "HTTP request");
    response
}

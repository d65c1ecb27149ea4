//! HTTP trigger surface: health, manual sync per domain, dry-run plans.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cisync_core::{Domain, SyncOutcome};
use cisync_sync::{maybe_build_scheduler, service_from_config, SyncConfig, SyncError, SyncService};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "cisync-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub scheduler_enabled: bool,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, scheduler_enabled: bool) -> Self {
        Self {
            service,
            scheduler_enabled,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/sync", post(sync_all_handler))
        .route("/sync/cancel", post(cancel_handler))
        .route("/sync/{domain}", post(sync_domain_handler))
        .route("/plan/{domain}", get(plan_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serves the router on `0.0.0.0:<PORT>` with the optional scheduler. Ctrl-C stops the
/// in-flight run between pairs; the server returns once that run has finished.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let shutdown = CancellationToken::new();
    let service = Arc::new(service_from_config(&config)?.with_shutdown(shutdown.clone()));

    let scheduler = maybe_build_scheduler(service.clone(), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let state = AppState::new(service.clone(), scheduler.is_some());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested");
            signal.cancel();
        }
    });

    let stopped = shutdown.clone();
    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { stopped.cancelled().await })
        .await;

    shutdown.cancel();
    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    if service.is_running() {
        info!("waiting for the in-flight sync to stop");
    }
    service.wait_idle().await;
    served?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "message": "cisync is up",
        "scheduler_enabled": state.scheduler_enabled,
        "running": state.service.is_running(),
    }))
    .into_response()
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    run_response(state.service.spawn_cycle()).await
}

async fn sync_domain_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Response {
    let domain = match domain.parse::<Domain>() {
        Ok(domain) => domain,
        Err(err) => return bad_request(err),
    };
    run_response(state.service.spawn_domain(domain)).await
}

async fn plan_handler(State(state): State<Arc<AppState>>, Path(domain): Path<String>) -> Response {
    let domain = match domain.parse::<Domain>() {
        Ok(domain) => domain,
        Err(err) => return bad_request(err),
    };
    match state.service.plan_domain(domain).await {
        Ok(plan) => Json(json!({
            "message": format!("{} pending actions", plan.actions.len()),
            "plan": plan,
        }))
        .into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    let cancelled = state.service.cancel();
    let message = if cancelled {
        "cancellation requested"
    } else {
        "no sync in flight"
    };
    Json(json!({ "message": message, "cancelled": cancelled })).into_response()
}

/// Runs live on their own task, so a client that disconnects does not cut a run short.
async fn run_response(run: JoinHandle<Result<SyncOutcome, SyncError>>) -> Response {
    match run.await {
        Ok(Ok(outcome)) => outcome_response(outcome),
        Ok(Err(err)) => sync_error_response(err),
        Err(err) => {
            error!(error = %err, "sync task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "sync failed", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// Partial pair failures still answer 200; an aborted domain answers 500.
fn outcome_response(outcome: SyncOutcome) -> Response {
    if let Some(abort) = outcome.aborted.first() {
        let message = format!("sync aborted for {}: {}", abort.domain, abort.error);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": message, "outcome": outcome })),
        )
            .into_response();
    }
    let message = if outcome.cancelled {
        "sync cancelled"
    } else {
        "sync complete"
    };
    Json(json!({ "message": message, "outcome": outcome })).into_response()
}

fn sync_error_response(err: SyncError) -> Response {
    let status = match err {
        SyncError::AlreadyRunning => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "message": "sync failed", "error": err.to_string() })),
    )
        .into_response()
}

fn bad_request(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "message": "bad request", "error": err.to_string() })),
    )
        .into_response()
}

// REST surface over the kernel.
//
// Handlers are thin: they decode the body, call the kernel and map
// `KernelError` onto a status code. Commits and replays run on the blocking
// pool because they can wait on the commit lock or re-execute history.

use crate::error::KernelError;
use crate::gate::GateReason;
use crate::kernel::Kernel;
use crate::ledger::CommitMarker;
use crate::pipeline::CommitOutcome;
use crate::replay::ReplayIntegrityError;
use crate::state::State as LiveState;
use crate::store::{Draft, StoreError};
use crate::transition::Event;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub session: String,
    pub event: Event,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub session: String,
    /// Optional bound on the wait for the commit lock.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub to: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Divergence {
    pub sequence: Option<u64>,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub verified: bool,
    pub from: u64,
    pub to: u64,
    pub markers_replayed: u64,
    pub final_state_hash: Option<String>,
    pub divergence: Option<Divergence>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct DiscardResponse {
    pub discarded: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<GateReason>,
}

#[derive(Debug)]
pub enum ApiError {
    Kernel(KernelError),
    Internal(String),
}

impl From<KernelError> for ApiError {
    fn from(e: KernelError) -> Self {
        ApiError::Kernel(e)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        let ApiError::Kernel(e) = self else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match e.kind() {
            "gate_rejected" | "already_drafting" | "concurrent_commit_conflict" => {
                StatusCode::CONFLICT
            }
            "unknown_draft" => StatusCode::NOT_FOUND,
            "invalid_session" | "bad_range" => StatusCode::BAD_REQUEST,
            "transition_error" | "draft_limit" | "hold_not_satisfied" | "empty_commit"
            | "pipeline_stage_error" => StatusCode::UNPROCESSABLE_ENTITY,
            "commit_timeout" | "halted" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ApiError::Kernel(e) => ErrorBody {
                error: e.kind(),
                message: e.to_string(),
                reason: match e {
                    KernelError::Gate(g) => Some(g.reason.clone()),
                    _ => None,
                },
            },
            ApiError::Internal(msg) => ErrorBody {
                error: "internal",
                message: msg.clone(),
                reason: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/health", get(health))
        .route("/draft/begin", post(begin_draft))
        .route("/draft/update", post(update_draft))
        .route("/draft/discard", post(discard_draft))
        .route("/drafts/:session", get(get_draft))
        .route("/commit", post(commit))
        .route("/ledger/tip", get(ledger_tip))
        .route("/ledger/marker/:sequence", get(ledger_marker))
        .route("/replay/marker", post(replay_marker))
        .with_state(kernel)
}

pub async fn serve(listen_addr: &str, kernel: Arc<Kernel>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "http api listening");
    axum::serve(listener, router(kernel))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

pub async fn get_state(State(kernel): State<Arc<Kernel>>) -> Json<LiveState> {
    Json(*kernel.state())
}

pub async fn health(State(kernel): State<Arc<Kernel>>) -> Json<HealthResponse> {
    let halted = kernel.is_halted();
    Json(HealthResponse {
        status: if halted { "halted" } else { "ok" },
        halted,
        halt_reason: kernel.halt_reason(),
        sequence: kernel.ledger_len(),
    })
}

pub async fn begin_draft(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<Draft>, ApiError> {
    let handle = kernel.begin_draft(&req.session)?;
    Ok(Json(kernel.draft(&handle)?))
}

pub async fn update_draft(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<Draft>, ApiError> {
    let draft = kernel.update(&req.session, req.event)?;
    debug!(session = %req.session, event = %req.event, tick = draft.working.tick, "draft updated");
    Ok(Json(draft))
}

pub async fn discard_draft(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<DiscardResponse>, ApiError> {
    let handle = session_handle(&kernel, &req.session)?;
    kernel.discard(&handle)?;
    Ok(Json(DiscardResponse { discarded: true }))
}

pub async fn get_draft(
    State(kernel): State<Arc<Kernel>>,
    Path(session): Path<String>,
) -> Result<Json<Draft>, ApiError> {
    let handle = session_handle(&kernel, &session)?;
    Ok(Json(kernel.draft(&handle)?))
}

pub async fn commit(
    State(kernel): State<Arc<Kernel>>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<CommitOutcome>, ApiError> {
    let handle = session_handle(&kernel, &req.session)?;
    let outcome = tokio::task::spawn_blocking(move || match req.timeout_ms {
        Some(ms) => kernel.commit_with_timeout(&handle, Duration::from_millis(ms)),
        None => kernel.commit(&handle),
    })
    .await
    .map_err(|e| ApiError::Internal(format!("commit task failed: {e}")))??;
    Ok(Json(outcome))
}

pub async fn ledger_tip(State(kernel): State<Arc<Kernel>>) -> Result<Json<CommitMarker>, StatusCode> {
    kernel.tip().map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn ledger_marker(
    State(kernel): State<Arc<Kernel>>,
    Path(sequence): Path<u64>,
) -> Result<Json<CommitMarker>, StatusCode> {
    kernel.marker(sequence).map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn replay_marker(
    State(kernel): State<Arc<Kernel>>,
    body: Option<Json<ReplayRequest>>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let whole = req.from.is_none() && req.to.is_none();
    let from = req.from.unwrap_or(1);
    let to = req.to.unwrap_or_else(|| kernel.ledger_len());

    // Replay re-executes from genesis; keep it off the async workers.
    let result = tokio::task::spawn_blocking(move || {
        if whole {
            kernel.replay_all()
        } else {
            kernel.replay(from..=to)
        }
    })
    .await
    .map_err(|e| ApiError::Internal(format!("replay task failed: {e}")))?;

    match result {
        Ok(report) => Ok(Json(ReplayResponse {
            verified: true,
            from: report.from,
            to: report.to,
            markers_replayed: report.markers_replayed,
            final_state_hash: Some(report.final_state_hash),
            divergence: None,
        })),
        Err(KernelError::Replay(e)) if e.is_integrity_fault() => Ok(Json(ReplayResponse {
            verified: false,
            from,
            to,
            markers_replayed: 0,
            final_state_hash: None,
            divergence: Some(divergence(&e)),
        })),
        Err(e) => Err(e.into()),
    }
}

fn divergence(e: &ReplayIntegrityError) -> Divergence {
    Divergence {
        sequence: e.sequence(),
        error: e.to_string(),
    }
}

fn session_handle(
    kernel: &Kernel,
    session: &str,
) -> Result<crate::store::DraftHandle, ApiError> {
    kernel.handle_for(session).ok_or_else(|| {
        ApiError::Kernel(KernelError::Store(StoreError::UnknownDraft {
            session: session.to_string(),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DraftLimits;
    use crate::constants::Constants;
    use crate::kernel::FixedClock;
    use crate::state::Stability;

    fn kernel() -> Arc<Kernel> {
        Arc::new(
            Kernel::new(Constants::default(), DraftLimits::default())
                .with_clock(Arc::new(FixedClock(1_700_000_000_000))),
        )
    }

    async fn push(k: &Arc<Kernel>, session: &str, event: Event) -> Result<Json<Draft>, ApiError> {
        update_draft(
            State(Arc::clone(k)),
            Json(UpdateRequest {
                session: session.to_string(),
                event,
            }),
        )
        .await
    }

    fn commit_req(session: &str) -> Json<CommitRequest> {
        Json(CommitRequest {
            session: session.to_string(),
            timeout_ms: None,
        })
    }

    #[test]
    fn router_builds() {
        let _ = router(kernel());
    }

    #[tokio::test]
    async fn update_then_commit_returns_state_and_marker() {
        let k = kernel();
        push(&k, "ui", Event::Pressure).await.unwrap();
        let Json(draft) = push(&k, "ui", Event::Pressure).await.unwrap();
        assert_eq!(draft.pending_ops.len(), 2);
        assert_eq!(get_state(State(Arc::clone(&k))).await.0.tick, 0);

        let Json(out) = commit(State(Arc::clone(&k)), commit_req("ui")).await.unwrap();
        assert_eq!(out.state.stability, Stability::Warning);
        assert_eq!(out.marker.sequence, 1);

        let Json(live) = get_state(State(Arc::clone(&k))).await;
        assert_eq!(live, out.state);
        let Json(tip) = ledger_tip(State(Arc::clone(&k))).await.unwrap();
        assert_eq!(tip, out.marker);
    }

    #[tokio::test]
    async fn gate_failure_is_409_with_reason() {
        let k = kernel();
        for _ in 0..7 {
            push(&k, "ui", Event::Pressure).await.unwrap();
        }
        let err = commit(State(Arc::clone(&k)), commit_req("ui"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(matches!(
            err,
            ApiError::Kernel(KernelError::Gate(ref g))
                if matches!(g.reason, GateReason::LoadExceeded { .. })
        ));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
        // Draft is still there.
        assert!(get_draft(State(Arc::clone(&k)), Path("ui".to_string()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn collapsed_draft_rejects_pressure_with_422() {
        let k = kernel();
        for _ in 0..9 {
            push(&k, "ui", Event::Pressure).await.unwrap();
        }
        let err = push(&k, "ui", Event::Pressure).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let Json(d) = push(&k, "ui", Event::Reset).await.unwrap();
        assert_eq!(d.working.stability, Stability::Stable);
        assert_eq!(d.working.cycle, 0);
    }

    #[tokio::test]
    async fn commit_without_draft_is_404() {
        let k = kernel();
        let err = commit(State(k), commit_req("nobody")).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn begin_twice_is_409_and_discard_frees() {
        let k = kernel();
        let req = || {
            Json(SessionRequest {
                session: "ui".to_string(),
            })
        };
        begin_draft(State(Arc::clone(&k)), req()).await.unwrap();
        let err = begin_draft(State(Arc::clone(&k)), req()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let Json(r) = discard_draft(State(Arc::clone(&k)), req()).await.unwrap();
        assert!(r.discarded);
        assert!(begin_draft(State(Arc::clone(&k)), req()).await.is_ok());
    }

    #[tokio::test]
    async fn replay_reports_verification() {
        let k = kernel();
        for _ in 0..3 {
            push(&k, "ui", Event::Pressure).await.unwrap();
            push(&k, "ui", Event::Release).await.unwrap();
            commit(State(Arc::clone(&k)), commit_req("ui")).await.unwrap();
        }
        let Json(r) = replay_marker(State(Arc::clone(&k)), None).await.unwrap();
        assert!(r.verified);
        assert_eq!(r.to, 3);
        assert_eq!(r.markers_replayed, 3);
        assert_eq!(
            r.final_state_hash,
            Some(hex::encode(k.tip().unwrap().state_hash))
        );

        let err = replay_marker(
            State(Arc::clone(&k)),
            Some(Json(ReplayRequest {
                from: Some(2),
                to: Some(10),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!k.is_halted());
    }

    #[tokio::test]
    async fn replay_of_empty_ledger_verifies_genesis() {
        let k = kernel();
        let Json(r) = replay_marker(State(Arc::clone(&k)), None).await.unwrap();
        assert!(r.verified);
        assert_eq!(r.markers_replayed, 0);
        assert_eq!(
            r.final_state_hash,
            Some(hex::encode(crate::state::state_hash(&k.state())))
        );
        assert!(r.divergence.is_none());
        assert!(!k.is_halted());
    }

    #[tokio::test]
    async fn empty_commit_is_422() {
        let k = kernel();
        begin_draft(
            State(Arc::clone(&k)),
            Json(SessionRequest {
                session: "ui".to_string(),
            }),
        )
        .await
        .unwrap();
        let err = commit(State(k), commit_req("ui")).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_marker_is_404() {
        let k = kernel();
        assert_eq!(
            ledger_marker(State(Arc::clone(&k)), Path(1)).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ledger_tip(State(k)).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn health_reports_sequence() {
        let k = kernel();
        push(&k, "ui", Event::Release).await.unwrap();
        commit(State(Arc::clone(&k)), commit_req("ui")).await.unwrap();
        let Json(h) = health(State(k)).await;
        assert_eq!(h.status, "ok");
        assert_eq!(h.sequence, 1);
        assert!(!h.halted);
    }
}

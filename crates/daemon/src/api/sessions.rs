use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use engine::BlockField;

use crate::error::PipelineError;
use crate::session::{ActionOutcome, BatchReport, Session, SessionManager, SessionSnapshot};

#[derive(Deserialize, Default)]
pub struct EditBlockRequest {
    text: Option<String>,
    user_prompt: Option<String>,
    voice_id: Option<String>,
}

#[derive(Serialize)]
pub struct ActionResponse {
    #[serde(flatten)]
    outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<BatchReport>,
    snapshot: SessionSnapshot,
}

type Manager = Arc<SessionManager>;

pub fn router(manager: Manager) -> Router {
    Router::new()
        .route("/:project", post(open_session).get(get_session).delete(close_session))
        .route("/:project/refresh", post(refresh_session))
        .route("/:project/blocks/:block_id", patch(edit_block))
        .route("/:project/blocks/:block_id/audio", post(generate_block_audio))
        .route("/:project/blocks/:block_id/video", post(generate_block_video))
        .route("/:project/videos", post(generate_all_videos))
        .route("/:project/full_audio", post(generate_full_audio))
        .route("/:project/stitch", post(stitch_video))
        .route("/:project/mux", post(mux_audio_video))
        .with_state(manager)
}

fn lookup(manager: &SessionManager, project: &str) -> Result<Arc<Session>, StatusCode> {
    manager.get(project).ok_or(StatusCode::NOT_FOUND)
}

fn error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::UnknownBlock(_) => StatusCode::NOT_FOUND,
        PipelineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Busy(_) | PipelineError::Unavailable(_) => StatusCode::CONFLICT,
        PipelineError::Transport { .. }
        | PipelineError::BackendRejection { .. }
        | PipelineError::NotConfirmed { .. } => StatusCode::BAD_GATEWAY,
    }
}

/// Run an action detached from the request, so a dropped connection does not cancel it.
async fn detached<T, A, F>(session: Arc<Session>, action: A) -> Result<T, StatusCode>
where
    A: FnOnce(Arc<Session>) -> F,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(action(session)).await.map_err(|e| {
        error!("[API] Action task failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn respond(
    session: &Session,
    outcome: ActionOutcome,
    report: Option<BatchReport>,
) -> (StatusCode, Json<ActionResponse>) {
    let status = match outcome {
        ActionOutcome::Rejected { .. } => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(ActionResponse {
            outcome,
            report,
            snapshot: session.snapshot(),
        }),
    )
}

async fn open_session(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    let session = manager.open(&project).await.map_err(|e| {
        error!("[API] Failed to open {}: {}", project, e);
        error_status(&e)
    })?;
    Ok(Json(session.snapshot()))
}

async fn get_session(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    Ok(Json(lookup(&manager, &project)?.snapshot()))
}

async fn close_session(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> StatusCode {
    if manager.close(&project) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn refresh_session(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    let session = lookup(&manager, &project)?;
    let session = detached(session, |s| async move {
        s.refresh().await;
        s
    })
    .await?;
    Ok(Json(session.snapshot()))
}

async fn edit_block(
    State(manager): State<Manager>,
    Path((project, block_id)): Path<(String, String)>,
    Json(req): Json<EditBlockRequest>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    let session = lookup(&manager, &project)?;

    let edits = [
        req.text.map(BlockField::Text),
        req.user_prompt.map(BlockField::UserPrompt),
        req.voice_id.map(BlockField::VoiceId),
    ];
    for field in edits.into_iter().flatten() {
        session
            .edit(&block_id, field)
            .map_err(|e| error_status(&e))?;
    }

    Ok(Json(session.snapshot()))
}

async fn generate_block_audio(
    State(manager): State<Manager>,
    Path((project, block_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let session = lookup(&manager, &project)?;
    let outcome = detached(session.clone(), |s| async move {
        s.generate_block_audio(&block_id).await
    })
    .await?;
    Ok(respond(&session, outcome, None))
}

async fn generate_block_video(
    State(manager): State<Manager>,
    Path((project, block_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let session = lookup(&manager, &project)?;
    let outcome = detached(session.clone(), |s| async move {
        s.generate_block_video(&block_id).await
    })
    .await?;
    Ok(respond(&session, outcome, None))
}

async fn generate_all_videos(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let session = lookup(&manager, &project)?;
    let report = detached(session.clone(), |s| async move { s.generate_all_videos().await }).await?;
    Ok(respond(&session, report.outcome(), Some(report)))
}

async fn generate_full_audio(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let session = lookup(&manager, &project)?;
    let outcome =
        detached(session.clone(), |s| async move { s.generate_full_audio().await }).await?;
    Ok(respond(&session, outcome, None))
}

async fn stitch_video(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let session = lookup(&manager, &project)?;
    let outcome = detached(session.clone(), |s| async move { s.stitch_video().await }).await?;
    Ok(respond(&session, outcome, None))
}

async fn mux_audio_video(
    State(manager): State<Manager>,
    Path(project): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), StatusCode> {
    let session = lookup(&manager, &project)?;
    let outcome = detached(session.clone(), |s| async move { s.mux_audio_video().await }).await?;
    Ok(respond(&session, outcome, None))
}

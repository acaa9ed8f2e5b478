use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use tickd_core::action::{Action, ActionStatus, ActionType};
use uuid::Uuid;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse::<Uuid>()
        .map_err(|_| AppError::bad_request(format!("invalid action id '{raw}'")))
}

#[derive(Deserialize)]
pub struct EnqueueBody {
    pub action_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

/// POST /api/actions: submit an action. Resubmitting a known idempotency
/// key returns the existing record untouched.
pub async fn enqueue(
    State(app): State<AppState>,
    Json(body): Json<EnqueueBody>,
) -> Result<Json<Action>, AppError> {
    let action_type: ActionType = body.action_type.parse()?;
    let payload = if body.payload.is_null() {
        serde_json::json!({})
    } else {
        body.payload
    };
    let queue = app.queue.clone();
    let action =
        blocking(move || queue.enqueue(action_type, payload, &body.idempotency_key)).await?;
    Ok(Json(action))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    /// Look up by idempotency key; yields at most one action.
    pub key: Option<String>,
}

/// GET /api/actions?status=&limit=&key=: actions in creation order.
pub async fn list_actions(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Action>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<ActionStatus>())
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let queue = app.queue.clone();
    let actions = match query.key {
        Some(key) => blocking(move || queue.get_by_key(&key))
            .await?
            .into_iter()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect(),
        None => blocking(move || queue.list(status, query.limit)).await?,
    };
    Ok(Json(actions))
}

/// GET /api/actions/{id}: one action plus its execution history.
pub async fn get_action(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    let queue = app.queue.clone();
    let (action, history) = blocking(move || Ok((queue.get(id)?, queue.history(id)?))).await?;
    Ok(Json(serde_json::json!({
        "action": action,
        "history": history,
    })))
}

/// POST /api/actions/{id}/requeue: manual retry of a dead-lettered action.
pub async fn requeue_action(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Action>, AppError> {
    let id = parse_id(&id)?;
    let queue = app.queue.clone();
    Ok(Json(blocking(move || queue.requeue(id)).await?))
}

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tickd_core::control::{ControlFlags, Mode};

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/control: current control flags.
pub async fn get_control(State(app): State<AppState>) -> Result<Json<ControlFlags>, AppError> {
    let control = app.control.clone();
    Ok(Json(blocking(move || control.flags()).await?))
}

/// POST /api/control/pause
pub async fn pause(State(app): State<AppState>) -> Result<Json<ControlFlags>, AppError> {
    let control = app.control.clone();
    Ok(Json(blocking(move || control.pause()).await?))
}

/// POST /api/control/resume
pub async fn resume(State(app): State<AppState>) -> Result<Json<ControlFlags>, AppError> {
    let control = app.control.clone();
    Ok(Json(blocking(move || control.resume()).await?))
}

#[derive(Deserialize, Default)]
pub struct KillBody {
    #[serde(default)]
    pub clear: bool,
}

/// POST /api/control/kill: every daemon sharing the store stops at its next
/// tick boundary. `{"clear": true}` lifts the flag again; an empty body sets it.
pub async fn kill(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<ControlFlags>, AppError> {
    let body: KillBody = if body.is_empty() {
        KillBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid kill body: {e}")))?
    };
    let control = app.control.clone();
    Ok(Json(blocking(move || control.set_killed(!body.clear)).await?))
}

#[derive(Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

/// PUT /api/control/mode: `{"mode": "proof" | "real"}`.
pub async fn set_mode(
    State(app): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<Json<ControlFlags>, AppError> {
    let mode: Mode = body.mode.parse()?;
    let control = app.control.clone();
    Ok(Json(blocking(move || control.set_mode(mode)).await?))
}

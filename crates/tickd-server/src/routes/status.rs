use axum::extract::State;
use axum::Json;
use tickd_core::control::Status;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/status: control flags, lease, queue depth and recent history.
pub async fn get_status(State(app): State<AppState>) -> Result<Json<Status>, AppError> {
    let control = app.control.clone();
    let status = blocking(move || control.get_status()).await?;
    Ok(Json(status))
}

use anyhow::anyhow;
use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use tracing::info;

use super::error::ApiError;
use super::types::{HealthResponse, ParaphraseRequest, ParaphraseResponse, WelcomeResponse};
use super::AppState;
use crate::paraphrase::within_limit;

pub async fn root() -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: "Welcome to the Paraphrasing API. Use /paraphrase to paraphrase text.",
    })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn paraphrase(
    State(state): State<AppState>,
    payload: Result<Json<ParaphraseRequest>, JsonRejection>,
) -> Result<Json<ParaphraseResponse>, ApiError> {
    let Json(req) = payload.map_err(|rejection| ApiError::MalformedBody(rejection.body_text()))?;

    if !within_limit(&req.text) {
        return Err(ApiError::TextTooLong {
            chars: req.text.chars().count(),
        });
    }

    info!(
        chars = req.text.chars().count(),
        mode = %state.paraphraser.mode(),
        "paraphrase request"
    );

    let paraphraser = state.paraphraser.clone();
    let result = tokio::task::spawn_blocking(move || paraphraser.paraphrase(&req.text))
        .await
        .map_err(|e| anyhow!("paraphrase task aborted: {e}"))??;

    Ok(Json(ParaphraseResponse { result }))
}

use serde::{Deserialize, Serialize};

use crate::paraphrase::ParaphraseResult;

#[derive(Debug, Deserialize)]
pub struct ParaphraseRequest {
    /// Absent `text` means an empty paraphrase request, not a malformed one.
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ParaphraseResponse {
    pub result: ParaphraseResult,
}

#[derive(Debug, Serialize)]
pub struct WelcomeResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
}

use crate::error::{GatewayError, WorkerError};
use crate::providers::ImageAttachment;
use std::time::Duration;

/// One submitted generation job, immutable once accepted by a lane.
///
/// `history` is the full rendered snapshot for the model: a persona
/// system line (when one is active) followed by the prior turns, each
/// already formatted as `Speaker: text`.
#[derive(Debug)]
pub struct GenerationRequest {
    pub prompt: String,
    pub history: Vec<String>,
    pub image: Option<ImageAttachment>,
}

/// The single terminal result a worker emits per accepted request.
#[derive(Debug)]
pub enum GenerationOutcome {
    Success { text: String, elapsed: Duration },
    Failure { error: WorkerError },
}

/// Map a worker failure to the one displayable message category it
/// belongs to. Total by construction: every error kind lands in exactly
/// one arm, and the original cause is logged by the dispatcher before
/// this string ever reaches a user.
pub fn user_message(error: &WorkerError) -> &'static str {
    match error {
        WorkerError::RetryExhausted { source, .. } => match source {
            GatewayError::RateLimited => {
                "The model API is rate limited right now — please try again in a moment."
            }
            GatewayError::Auth => {
                "Authentication with the model API failed — check the configured API key."
            }
            GatewayError::InvalidInput(_) => {
                "The request was rejected as invalid — adjust the prompt and try again."
            }
            GatewayError::ServiceUnavailable(_) | GatewayError::Network(_) => {
                "Could not reach the model API — check your connection and try again."
            }
            GatewayError::Unknown(_) => "An unexpected error occurred — please try again.",
        },
        WorkerError::Superseded => "This request was replaced by a newer one before it started.",
        WorkerError::ShuttingDown => "The assistant is shutting down and cannot take requests.",
    }
}

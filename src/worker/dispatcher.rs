use super::lane::WorkerLane;
use super::request::{GenerationOutcome, GenerationRequest, user_message};
use crate::config::ReliabilityConfig;
use crate::error::WorkerError;
use crate::ledger::ConversationLedger;
use crate::providers::{ImageAttachment, ModelGateway};
use crate::usage::UsageLog;
use std::sync::Arc;
use std::time::Duration;

/// Flat token surcharge applied when an image was processed.
pub const IMAGE_TOKEN_SURCHARGE: u64 = 258;

/// Caller-facing result of one successful generation.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub tokens_used: u64,
    pub elapsed: Duration,
}

/// Routes submissions to the text or image lane, adapts the lane's
/// terminal outcome, and owns the ledger mutation that follows a
/// success. Never retries on its own — retry lives in the lanes.
pub struct RequestDispatcher {
    text_lane: WorkerLane,
    image_lane: WorkerLane,
    usage_log: Option<Arc<UsageLog>>,
}

impl RequestDispatcher {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        reliability: &ReliabilityConfig,
        usage_log: Option<Arc<UsageLog>>,
    ) -> Self {
        Self {
            text_lane: WorkerLane::spawn("text", Arc::clone(&gateway), reliability),
            image_lane: WorkerLane::spawn("image", gateway, reliability),
            usage_log,
        }
    }

    /// Submit a prompt for `session_id` and wait for its terminal
    /// outcome. On success the ledger receives exactly one mutation
    /// (user turn + assistant turn + usage record together); on failure
    /// the ledger is untouched and the classified error is returned for
    /// the caller to display with a retry affordance.
    pub async fn submit(
        &self,
        session_id: &str,
        ledger: &ConversationLedger,
        prompt: &str,
        image: Option<ImageAttachment>,
        persona_prefix: Option<&str>,
    ) -> Result<ChatReply, WorkerError> {
        let has_image = image.is_some();
        let lane = if has_image {
            &self.image_lane
        } else {
            &self.text_lane
        };

        let mut history = Vec::new();
        if let Some(prefix) = persona_prefix {
            history.push(format!("System: {prefix}"));
        }
        history.extend(ledger.rendered_history());

        let receiver = lane.submit(GenerationRequest {
            prompt: prompt.to_string(),
            history,
            image,
        })?;

        let outcome = match receiver.await {
            Ok(outcome) => outcome,
            // The reply channel was dropped: either our request was
            // replaced in the slot, or the lane stopped underneath us.
            Err(_) if lane.is_shutting_down() => return Err(WorkerError::ShuttingDown),
            Err(_) => return Err(WorkerError::Superseded),
        };

        match outcome {
            GenerationOutcome::Success { text, elapsed } => {
                let tokens = estimate_tokens(prompt, &text, has_image);
                let user_text = if has_image {
                    format!("{prompt} [image attached]")
                } else {
                    prompt.to_string()
                };
                ledger.append_exchange(&user_text, &text, tokens, elapsed);

                if let Some(log) = &self.usage_log {
                    if let Err(error) = log.record(session_id, tokens) {
                        // The reply already happened; a bookkeeping miss
                        // must not turn it into a failure.
                        tracing::warn!(session_id, %error, "failed to persist usage record");
                    }
                }

                tracing::info!(
                    session_id,
                    tokens,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "generation completed"
                );
                Ok(ChatReply {
                    text,
                    tokens_used: tokens,
                    elapsed,
                })
            }
            GenerationOutcome::Failure { error } => {
                tracing::error!(
                    session_id,
                    cause = %error,
                    display = user_message(&error),
                    "generation failed"
                );
                Err(error)
            }
        }
    }

    /// Drop requests that have not started yet, on both lanes.
    pub fn cancel_pending(&self) {
        self.text_lane.cancel_pending();
        self.image_lane.cancel_pending();
    }

    /// Stop both lanes at their next wait or backoff boundary. In-flight
    /// model calls finish naturally; their outcomes are discarded.
    pub fn shutdown(&self) {
        self.text_lane.shutdown();
        self.image_lane.shutdown();
    }
}

/// Word-count token approximation, plus a fixed surcharge for an image.
fn estimate_tokens(prompt: &str, response: &str, has_image: bool) -> u64 {
    let words = prompt.split_whitespace().count() + response.split_whitespace().count();
    let mut tokens = words as u64;
    if has_image {
        tokens += IMAGE_TOKEN_SURCHARGE;
    }
    tokens
}

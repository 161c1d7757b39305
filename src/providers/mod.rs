pub mod gemini;
pub mod traits;

pub use gemini::GeminiGateway;
pub use traits::{Completion, ImageAttachment, ModelGateway, render_prompt};

const MAX_API_ERROR_CHARS: usize = 200;

/// Clip an API error body to a loggable excerpt.
///
/// Provider error bodies can be arbitrarily large JSON blobs; anything past
/// the first couple hundred characters is noise in logs and user payloads.
pub(crate) fn error_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_API_ERROR_CHARS {
        return trimmed.to_string();
    }
    let clipped: String = trimmed.chars().take(MAX_API_ERROR_CHARS).collect();
    format!("{clipped}…")
}

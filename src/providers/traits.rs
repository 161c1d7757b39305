use crate::error::GatewayError;
use async_trait::async_trait;

/// An image carried alongside a prompt, already decoded by the caller.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// One completed model call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    /// Model identifier echoed by the API, when it reports one.
    pub model: Option<String>,
}

impl Completion {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }
}

/// Render the full prompt sent to the model: prior turns joined with
/// newlines, then the new user line, with an attachment marker when an
/// image rides along.
pub fn render_prompt(prompt: &str, history: &[String], has_image: bool) -> String {
    let mut lines: Vec<&str> = history.iter().map(String::as_str).collect();
    let user_line = format!("User: {prompt}");
    lines.push(&user_line);
    let joined = lines.join("\n");
    if has_image {
        format!("{joined}\n\n[image attached]")
    } else {
        joined
    }
}

/// A single call against the external generative-language API.
///
/// Implementations classify transport failures into [`GatewayError`] but
/// never retry; retry policy belongs to the generation worker.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        history: &[String],
        image: Option<&ImageAttachment>,
    ) -> Result<Completion, GatewayError>;
}

use super::traits::{Completion, ImageAttachment, ModelGateway, render_prompt};
use crate::error::GatewayError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gateway to the Google generative-language API (`generateContent`).
pub struct GeminiGateway {
    api_key: String,
    cached_generate_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiGateway {
    pub fn new(api_key: impl Into<String>, model_id: &str, timeout_secs: u64) -> Self {
        Self::with_base_url(api_key, model_id, timeout_secs, None)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        model_id: &str,
        timeout_secs: u64,
        base_url: Option<&str>,
    ) -> Self {
        let base = base_url
            .map_or("https://generativelanguage.googleapis.com", |u| {
                u.trim_end_matches('/')
            })
            .to_string();
        let cached_generate_url = format!("{base}/v1beta/models/{model_id}:generateContent");
        Self {
            api_key: api_key.into(),
            cached_generate_url,
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .connect_timeout(Duration::from_secs(10))
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(Duration::from_secs(90))
                .tcp_keepalive(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_request(
        prompt: &str,
        history: &[String],
        image: Option<&ImageAttachment>,
    ) -> GenerateContentRequest {
        let mut parts = vec![Part {
            text: Some(render_prompt(prompt, history, image.is_some())),
            inline_data: None,
        }];
        if let Some(attachment) = image {
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: attachment.mime_type.clone(),
                    data: BASE64.encode(&attachment.data),
                }),
            });
        }
        GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
        }
    }

    fn extract_text(response: &GenerateContentResponse) -> Result<String, GatewayError> {
        let text = response
            .candidates
            .iter()
            .filter_map(|candidate| candidate.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(GatewayError::Unknown(
                "model returned no text candidates".into(),
            ));
        }
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    async fn invoke(
        &self,
        prompt: &str,
        history: &[String],
        image: Option<&ImageAttachment>,
    ) -> Result<Completion, GatewayError> {
        let request = Self::build_request(prompt, history, image);

        let response = self
            .client
            .post(&self.cached_generate_url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, super::error_excerpt(&body)));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unknown(e.to_string()))?;

        let text = Self::extract_text(&parsed)?;
        Ok(Completion {
            text,
            model: parsed.model_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway_for(server: &MockServer) -> GeminiGateway {
        GeminiGateway::with_base_url("test-key", "gemini-2.5-flash", 5, Some(&server.uri()))
    }

    fn completion_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }] }
            }],
            "modelVersion": "gemini-2.5-flash-001"
        })
    }

    #[tokio::test]
    async fn successful_call_returns_trimmed_text_and_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("  hello  ")))
            .mount(&server)
            .await;

        let completion = gateway_for(&server)
            .invoke("hi", &[], None)
            .await
            .unwrap();
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.model.as_deref(), Some("gemini-2.5-flash-001"));
    }

    #[tokio::test]
    async fn status_429_classifies_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let err = gateway_for(&server).invoke("hi", &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited));
    }

    #[tokio::test]
    async fn status_403_classifies_as_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = gateway_for(&server).invoke("hi", &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth));
    }

    #[tokio::test]
    async fn status_400_classifies_as_invalid_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("malformed"))
            .mount(&server)
            .await;

        let err = gateway_for(&server).invoke("hi", &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn status_503_classifies_as_service_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = gateway_for(&server).invoke("hi", &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_an_unknown_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})),
            )
            .mount(&server)
            .await;

        let err = gateway_for(&server).invoke("hi", &[], None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unknown(_)));
    }

    #[test]
    fn image_attachments_become_inline_data_parts() {
        let image = ImageAttachment {
            data: vec![1, 2, 3],
            mime_type: "image/png".into(),
        };
        let request = GeminiGateway::build_request("what is this", &[], Some(&image));
        let body = serde_json::to_value(&request).unwrap();
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], BASE64.encode([1u8, 2, 3]));
        assert!(
            parts[0]["text"]
                .as_str()
                .unwrap()
                .ends_with("[image attached]")
        );
    }
}

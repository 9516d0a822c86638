use std::io::Cursor;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::debug;

use crate::collaborator::Captioner;
use crate::config::CaptionConfig;
use crate::error::CollaboratorError;

/// Image captioner calling a hosted inference endpoint (BLIP by default).
pub struct HttpCaptioner {
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaptionResponse {
    Generated(Vec<GeneratedText>),
    Error { error: String },
}

#[derive(Deserialize)]
struct GeneratedText {
    generated_text: String,
}

impl HttpCaptioner {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            timeout,
        }
    }

    pub fn from_config(config: &CaptionConfig) -> Self {
        Self::new(config.endpoint.clone(), config.token(), config.timeout())
    }
}

fn parse_caption(body: &str) -> Result<String, CollaboratorError> {
    match serde_json::from_str::<CaptionResponse>(body) {
        Ok(CaptionResponse::Generated(items)) => items
            .into_iter()
            .next()
            .map(|item| item.generated_text.trim().to_string())
            .ok_or_else(|| CollaboratorError::Inference("no caption generated".to_string())),
        Ok(CaptionResponse::Error { error }) => Err(CollaboratorError::Inference(error)),
        Err(e) => Err(CollaboratorError::Inference(format!("unexpected response body: {e}"))),
    }
}

impl Captioner for HttpCaptioner {
    fn caption(&self, image: &DynamicImage) -> Result<String, CollaboratorError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| CollaboratorError::InvalidInput(e.to_string()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let mut request = client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/png")
            .body(png);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!("POST {} ({}x{} crop)", self.endpoint, image.width(), image.height());
        let response = request.send()?;
        let status = response.status();
        let body = response.text()?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CollaboratorError::Unavailable(format!(
                "{} rejected the credentials ({})",
                self.endpoint, status
            )));
        }
        parse_caption(&body)
    }

    fn name(&self) -> &str {
        "http-caption"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_text_is_trimmed() {
        let caption = parse_caption(r#"[{"generated_text": " a red car parked on a street "}]"#).unwrap();
        assert_eq!(caption, "a red car parked on a street");
    }

    #[test]
    fn error_body_is_an_inference_failure() {
        let err = parse_caption(r#"{"error": "Model is currently loading"}"#).unwrap_err();
        assert!(matches!(err, CollaboratorError::Inference(msg) if msg.contains("loading")));
    }

    #[test]
    fn empty_list_is_a_failure() {
        assert!(parse_caption("[]").is_err());
        assert!(parse_caption("<html>bad gateway</html>").is_err());
    }
}

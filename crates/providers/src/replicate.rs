//! Replicate-style predictions API.
//!
//! Submit: `POST /v1/models/{owner}/{name}/predictions` with `{"input": {..}}`.
//! Poll: `GET /v1/predictions/{id}`; `status` is one of `starting`,
//! `processing`, `succeeded`, `failed`, `canceled`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use genforge_generation::{GenerationParams, MediaKind, ProviderId, select_model};

use crate::adapter::{PollError, PollOutcome, ProviderAdapter, ProviderTaskId, SubmissionError};
use crate::http;
use crate::normalize::normalize_result_payload;

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com";

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ReplicateAdapter {
    client: Client,
    api_token: String,
    base_url: String,
}

impl ReplicateAdapter {
    pub fn new(client: Client, api_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            api_token: api_token.into(),
            base_url: base_url.into(),
        }
    }

    fn model_for(&self, kind: MediaKind, params: &GenerationParams) -> Result<String, SubmissionError> {
        Ok(select_model(ProviderId::Replicate, kind, params)?.to_string())
    }

    fn input_for(kind: MediaKind, params: &GenerationParams) -> Map<String, Value> {
        let mut input = Map::new();
        match kind {
            MediaKind::Upscale => {
                if let Some(image) = params.reference_urls.first() {
                    input.insert("image".into(), json!(image));
                }
                input.insert("scale".into(), json!(params.upscale_factor.unwrap_or(2)));
            }
            _ => {
                input.insert("prompt".into(), json!(params.prompt));
                input.insert("num_outputs".into(), json!(params.effective_count(kind)));
                if let Some(n) = &params.negative_prompt {
                    input.insert("negative_prompt".into(), json!(n));
                }
                if let Some(ar) = &params.aspect_ratio {
                    input.insert("aspect_ratio".into(), json!(ar));
                }
                if let Some(image) = params.reference_urls.first() {
                    input.insert("image_prompt".into(), json!(image));
                }
                if kind == MediaKind::Logo {
                    input.insert("style_type".into(), json!("Design"));
                }
            }
        }
        for (k, v) in &params.extra {
            input.insert(k.clone(), v.clone());
        }
        input
    }
}

#[async_trait]
impl ProviderAdapter for ReplicateAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Replicate
    }

    #[instrument(skip_all, fields(provider = "replicate", kind = %kind))]
    async fn submit(
        &self,
        kind: MediaKind,
        params: &GenerationParams,
    ) -> Result<ProviderTaskId, SubmissionError> {
        let model = self.model_for(kind, params)?;
        let url = http::join(&self.base_url, &format!("v1/models/{model}/predictions"));
        let body = json!({ "input": Self::input_for(kind, params) });

        let prediction: Prediction = http::send_submit(
            ProviderId::Replicate,
            self.client.post(url).bearer_auth(&self.api_token).json(&body),
        )
        .await?;

        if prediction.id.is_empty() {
            return Err(SubmissionError::InvalidResponse("prediction without id".into()));
        }
        debug!(task_id = %prediction.id, model = %model, "prediction created");
        Ok(ProviderTaskId::new(prediction.id))
    }

    #[instrument(skip_all, fields(provider = "replicate", task_id = %task_id))]
    async fn poll(&self, task_id: &ProviderTaskId) -> Result<PollOutcome, PollError> {
        let url = http::join(&self.base_url, &format!("v1/predictions/{}", task_id.as_str()));
        let response = http::send_poll(
            ProviderId::Replicate,
            self.client.get(url).bearer_auth(&self.api_token),
        )
        .await?;
        let prediction: Prediction = http::decode_poll(response).await?;

        Ok(match prediction.status.as_str() {
            "starting" | "processing" => PollOutcome::Waiting,
            "succeeded" => match normalize_result_payload(&prediction.output) {
                Some(asset_url) => PollOutcome::Succeeded { asset_url },
                None => PollOutcome::Failed {
                    detail: "prediction succeeded without an output url".into(),
                },
            },
            "failed" => PollOutcome::Failed {
                detail: error_text(prediction.error.as_ref(), "prediction failed"),
            },
            "canceled" => PollOutcome::Failed {
                detail: "prediction was canceled".into(),
            },
            other => {
                return Err(PollError::InvalidResponse(format!(
                    "unknown prediction status: {other}"
                )));
            }
        })
    }
}

fn error_text(error: Option<&Value>, fallback: &str) -> String {
    match error {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => fallback.to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upscale_input_carries_image_and_scale() {
        let p = GenerationParams::default()
            .reference("https://cdn.example/in.png")
            .upscale_factor(4);
        let input = ReplicateAdapter::input_for(MediaKind::Upscale, &p);
        assert_eq!(input["image"], json!("https://cdn.example/in.png"));
        assert_eq!(input["scale"], json!(4));
        assert!(!input.contains_key("prompt"));
    }

    #[test]
    fn extra_overrides_defaults() {
        let mut p = GenerationParams::with_prompt("owl");
        p.extra.insert("num_outputs".into(), json!(2));
        p.extra.insert("seed".into(), json!(9));
        let input = ReplicateAdapter::input_for(MediaKind::Image, &p);
        assert_eq!(input["num_outputs"], json!(2));
        assert_eq!(input["seed"], json!(9));
    }

    #[test]
    fn video_is_not_routed() {
        let adapter = ReplicateAdapter::new(Client::new(), "t", DEFAULT_BASE_URL);
        let err = adapter
            .model_for(MediaKind::Video, &GenerationParams::with_prompt("x"))
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Unsupported { .. }));
    }
}

//! fal-style queue API.
//!
//! Submit: `POST /{model}` returns `request_id`. Status:
//! `GET /{model}/requests/{id}/status` (`IN_QUEUE`, `IN_PROGRESS`,
//! `COMPLETED`). Result: `GET /{model}/requests/{id}`.
//!
//! The task id handed back to callers is `{model}#{request_id}` since the
//! model path is needed to poll.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use genforge_generation::{GenerationParams, MediaKind, ProviderId, select_model};

use crate::adapter::{PollError, PollOutcome, ProviderAdapter, ProviderTaskId, SubmissionError};
use crate::http;
use crate::normalize::normalize_result_payload;

pub const DEFAULT_BASE_URL: &str = "https://queue.fal.run";

const TASK_SEPARATOR: char = '#';

#[derive(Debug, Deserialize)]
struct QueueSubmitted {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct QueueStatus {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FalAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl FalAdapter {
    pub fn new(client: Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Key {}", self.api_key))
    }

    fn model_for(kind: MediaKind, params: &GenerationParams) -> Result<String, SubmissionError> {
        Ok(select_model(ProviderId::Fal, kind, params)?.to_string())
    }

    fn input_for(kind: MediaKind, params: &GenerationParams) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("prompt".into(), json!(params.prompt));
        if let Some(n) = &params.negative_prompt {
            input.insert("negative_prompt".into(), json!(n));
        }
        if let Some(ar) = &params.aspect_ratio {
            input.insert("aspect_ratio".into(), json!(ar));
        }
        match kind {
            MediaKind::Video => {
                input.insert("duration".into(), json!(params.effective_duration().to_string()));
                if let Some(res) = params.resolution {
                    input.insert("resolution".into(), json!(res.as_str()));
                }
                if params.audio {
                    input.insert("generate_audio".into(), json!(true));
                }
                if let Some(image) = params.reference_urls.first() {
                    input.insert("image_url".into(), json!(image));
                }
            }
            _ => {
                input.insert("num_images".into(), json!(params.effective_count(kind)));
                if let Some(image) = params.reference_urls.first() {
                    input.insert("image_url".into(), json!(image));
                }
            }
        }
        for (k, v) in &params.extra {
            input.insert(k.clone(), v.clone());
        }
        input
    }

    fn split_task_id(task_id: &ProviderTaskId) -> Result<(&str, &str), PollError> {
        task_id
            .as_str()
            .rsplit_once(TASK_SEPARATOR)
            .filter(|(model, id)| !model.is_empty() && !id.is_empty())
            .ok_or_else(|| PollError::InvalidTaskId(task_id.to_string()))
    }

    async fn fetch_result(&self, model: &str, request_id: &str) -> Result<PollOutcome, PollError> {
        let url = http::join(&self.base_url, &format!("{model}/requests/{request_id}"));
        let response =
            http::send_poll(ProviderId::Fal, self.authorized(self.client.get(url))).await?;

        // fal reports generation-time rejections (e.g. moderation) as 4xx on
        // the result endpoint.
        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Ok(PollOutcome::Failed {
                detail: error_detail(&detail),
            });
        }

        let body: Value = http::decode_poll(response).await?;
        Ok(match normalize_result_payload(&body) {
            Some(asset_url) => PollOutcome::Succeeded { asset_url },
            None => PollOutcome::Failed {
                detail: "request completed without an output url".into(),
            },
        })
    }
}

/// Pull `detail` (string or list of `{msg}`) out of an error body when present.
fn error_detail(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    match value.get("detail") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("msg").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.to_string(),
    }
}

#[async_trait]
impl ProviderAdapter for FalAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Fal
    }

    #[instrument(skip_all, fields(provider = "fal", kind = %kind))]
    async fn submit(
        &self,
        kind: MediaKind,
        params: &GenerationParams,
    ) -> Result<ProviderTaskId, SubmissionError> {
        let model = Self::model_for(kind, params)?;
        let url = http::join(&self.base_url, &model);
        let body = Value::Object(Self::input_for(kind, params));

        let submitted: QueueSubmitted = http::send_submit(
            ProviderId::Fal,
            self.authorized(self.client.post(url)).json(&body),
        )
        .await?;

        if submitted.request_id.is_empty() {
            return Err(SubmissionError::InvalidResponse("missing request_id".into()));
        }
        debug!(request_id = %submitted.request_id, model = %model, "queued");
        Ok(ProviderTaskId::new(format!(
            "{model}{TASK_SEPARATOR}{}",
            submitted.request_id
        )))
    }

    #[instrument(skip_all, fields(provider = "fal", task_id = %task_id))]
    async fn poll(&self, task_id: &ProviderTaskId) -> Result<PollOutcome, PollError> {
        let (model, request_id) = Self::split_task_id(task_id)?;
        let url = http::join(&self.base_url, &format!("{model}/requests/{request_id}/status"));
        let response =
            http::send_poll(ProviderId::Fal, self.authorized(self.client.get(url))).await?;
        let status: QueueStatus = http::decode_poll(response).await?;

        match status.status.as_str() {
            "IN_QUEUE" | "IN_PROGRESS" => Ok(PollOutcome::Waiting),
            "COMPLETED" => match status.error {
                Some(detail) if !detail.is_empty() => Ok(PollOutcome::Failed { detail }),
                _ => self.fetch_result(model, request_id).await,
            },
            other => {
                warn!(status = %other, "unexpected queue status");
                Err(PollError::InvalidResponse(format!("unknown queue status: {other}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_keeps_model_path() {
        let id = ProviderTaskId::new("fal-ai/kling-video/v2/master/text-to-video#abc-123");
        let (model, req) = FalAdapter::split_task_id(&id).unwrap();
        assert_eq!(model, "fal-ai/kling-video/v2/master/text-to-video");
        assert_eq!(req, "abc-123");

        assert!(FalAdapter::split_task_id(&ProviderTaskId::new("no-separator")).is_err());
        assert!(FalAdapter::split_task_id(&ProviderTaskId::new("model#")).is_err());
    }

    #[test]
    fn reference_image_selects_image_to_video() {
        let p = GenerationParams::with_prompt("pan left").reference("https://x/y.png");
        assert_eq!(
            FalAdapter::model_for(MediaKind::Video, &p).unwrap(),
            "fal-ai/kling-video/v2/master/image-to-video"
        );
        let input = FalAdapter::input_for(MediaKind::Video, &p.with_audio());
        assert_eq!(input["image_url"], json!("https://x/y.png"));
        assert_eq!(input["duration"], json!("5"));
        assert_eq!(input["generate_audio"], json!(true));
    }

    #[test]
    fn error_detail_reads_validation_lists() {
        let body = r#"{"detail":[{"msg":"content flagged by safety checker","type":"x"}]}"#;
        assert_eq!(error_detail(body), "content flagged by safety checker");
        assert_eq!(error_detail("plain"), "plain");
    }
}

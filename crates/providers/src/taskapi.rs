//! Generic task API (`createTask` / `recordInfo`).
//!
//! Every response is wrapped in `{"code": 200, "msg": "...", "data": {..}}`;
//! a non-200 `code` is an application-level error even on HTTP 200. The
//! finished result arrives in `data.resultJson`, a JSON document serialized as
//! a string.
//!
//! Reference images given as `data:` URIs are uploaded first, since the task
//! endpoint only accepts URLs.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use genforge_generation::{GenerationParams, MediaKind, ProviderId, select_model};

use crate::adapter::{PollError, PollOutcome, ProviderAdapter, ProviderTaskId, SubmissionError};
use crate::http;
use crate::normalize::normalize_result_payload;

pub const DEFAULT_BASE_URL: &str = "https://api.taskapi.example";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, (i64, String)> {
        match (self.code, self.data) {
            (200, Some(data)) => Ok(data),
            (200, None) => Err((200, "response without data".into())),
            (code, _) => Err((code, self.msg)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Created {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Uploaded {
    download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    state: String,
    #[serde(default)]
    result_json: Option<Value>,
    #[serde(default)]
    fail_msg: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskApiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl TaskApiAdapter {
    pub fn new(client: Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    async fn post_enveloped<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, SubmissionError> {
        let url = http::join(&self.base_url, path);
        let envelope: Envelope<T> = http::send_submit(
            ProviderId::TaskApi,
            self.client.post(url).bearer_auth(&self.api_key).json(body),
        )
        .await?;
        envelope.into_data().map_err(|(code, message)| match code {
            500..=599 => SubmissionError::Unavailable(message),
            _ => SubmissionError::Rejected {
                status: u16::try_from(code).unwrap_or(400),
                message,
            },
        })
    }

    /// Replace `data:` URIs with hosted URLs.
    async fn hosted_references(&self, refs: &[String]) -> Result<Vec<String>, SubmissionError> {
        let mut hosted = Vec::with_capacity(refs.len());
        for reference in refs {
            if reference.starts_with("data:") {
                let uploaded: Uploaded = self
                    .post_enveloped(
                        "api/v1/upload/base64",
                        &json!({ "base64Data": reference, "uploadPath": "references" }),
                    )
                    .await?;
                debug!(url = %uploaded.download_url, "reference uploaded");
                hosted.push(uploaded.download_url);
            } else {
                hosted.push(reference.clone());
            }
        }
        Ok(hosted)
    }

    fn model_for(kind: MediaKind, params: &GenerationParams) -> Result<String, SubmissionError> {
        Ok(select_model(ProviderId::TaskApi, kind, params)?.to_string())
    }

    fn input_for(
        kind: MediaKind,
        params: &GenerationParams,
        references: Vec<String>,
    ) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("prompt".into(), json!(params.prompt));
        if let Some(ar) = &params.aspect_ratio {
            input.insert("aspectRatio".into(), json!(ar));
        }
        if !references.is_empty() {
            input.insert("imageUrls".into(), json!(references));
        }
        match kind {
            MediaKind::Video => {
                input.insert("duration".into(), json!(params.effective_duration()));
                if let Some(res) = params.resolution {
                    input.insert("resolution".into(), json!(res.as_str()));
                }
                input.insert("enableAudio".into(), json!(params.audio));
            }
            MediaKind::MultiAngleSet => {
                input.insert("angles".into(), json!(params.effective_count(kind)));
            }
            _ => {
                input.insert("numImages".into(), json!(params.effective_count(kind)));
            }
        }
        for (k, v) in &params.extra {
            input.insert(k.clone(), v.clone());
        }
        input
    }
}

#[async_trait]
impl ProviderAdapter for TaskApiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::TaskApi
    }

    #[instrument(skip_all, fields(provider = "taskapi", kind = %kind))]
    async fn submit(
        &self,
        kind: MediaKind,
        params: &GenerationParams,
    ) -> Result<ProviderTaskId, SubmissionError> {
        let model = Self::model_for(kind, params)?;
        let references = self.hosted_references(&params.reference_urls).await?;
        let body = json!({
            "model": model,
            "input": Self::input_for(kind, params, references),
        });

        let created: Created = self.post_enveloped("api/v1/jobs/createTask", &body).await?;
        if created.task_id.is_empty() {
            return Err(SubmissionError::InvalidResponse("missing taskId".into()));
        }
        debug!(task_id = %created.task_id, model = %model, "task created");
        Ok(ProviderTaskId::new(created.task_id))
    }

    #[instrument(skip_all, fields(provider = "taskapi", task_id = %task_id))]
    async fn poll(&self, task_id: &ProviderTaskId) -> Result<PollOutcome, PollError> {
        let url = http::join(&self.base_url, "api/v1/jobs/recordInfo");
        let response = http::send_poll(
            ProviderId::TaskApi,
            self.client
                .get(url)
                .bearer_auth(&self.api_key)
                .query(&[("taskId", task_id.as_str())]),
        )
        .await?;
        let envelope: Envelope<Record> = http::decode_poll(response).await?;
        let record = envelope
            .into_data()
            .map_err(|(code, msg)| PollError::InvalidResponse(format!("code {code}: {msg}")))?;

        Ok(match record.state.as_str() {
            "waiting" | "queuing" | "generating" => PollOutcome::Waiting,
            "success" => match record.result_json.as_ref().and_then(normalize_result_payload) {
                Some(asset_url) => PollOutcome::Succeeded { asset_url },
                None => PollOutcome::Failed {
                    detail: "task succeeded without a result url".into(),
                },
            },
            "fail" => PollOutcome::Failed {
                detail: record
                    .fail_msg
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "task failed".into()),
            },
            other => {
                return Err(PollError::InvalidResponse(format!("unknown task state: {other}")));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_code_is_checked() {
        let ok: Envelope<Created> =
            serde_json::from_value(json!({"code": 200, "msg": "success", "data": {"taskId": "t1"}}))
                .unwrap();
        assert_eq!(ok.into_data().unwrap().task_id, "t1");

        let err: Envelope<Created> =
            serde_json::from_value(json!({"code": 402, "msg": "insufficient balance", "data": null}))
                .unwrap();
        assert_eq!(err.into_data().unwrap_err(), (402, "insufficient balance".to_string()));
    }

    #[test]
    fn multi_angle_input_requests_angles() {
        let p = GenerationParams::with_prompt("sneaker").count(6);
        let input = TaskApiAdapter::input_for(
            MediaKind::MultiAngleSet,
            &p,
            vec!["https://x/ref.png".into()],
        );
        assert_eq!(input["angles"], json!(6));
        assert_eq!(input["imageUrls"], json!(["https://x/ref.png"]));
    }
}

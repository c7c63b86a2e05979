//! Adapter behaviour against mocked provider HTTP APIs.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use genforge_generation::{GenerationParams, MediaKind, ProviderId};
use genforge_providers::{
    FalAdapter, PollOutcome, ProviderAdapter, ProviderTaskId, ReplicateAdapter, SubmissionError,
    TaskApiAdapter,
};

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn replicate_submit_and_poll_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/models/black-forest-labs/flux-schnell/predictions"))
        .and(header("authorization", "Bearer r8_test"))
        .and(body_partial_json(json!({"input": {"prompt": "a red kite"}})))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"id": "pred-1", "status": "starting"})),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/predictions/pred-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pred-1",
            "status": "succeeded",
            "output": ["https://replicate.delivery/out-0.webp"]
        })))
        .mount(&server)
        .await;

    let adapter = ReplicateAdapter::new(client(), "r8_test", server.uri());
    let task = adapter
        .submit(MediaKind::Image, &GenerationParams::with_prompt("a red kite"))
        .await
        .unwrap();
    assert_eq!(task.as_str(), "pred-1");

    let outcome = adapter.poll(&task).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Succeeded {
            asset_url: "https://replicate.delivery/out-0.webp".into()
        }
    );
}

#[tokio::test]
async fn replicate_failed_prediction_carries_error_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/predictions/pred-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pred-2",
            "status": "failed",
            "error": "NSFW content detected"
        })))
        .mount(&server)
        .await;

    let adapter = ReplicateAdapter::new(client(), "t", server.uri());
    let outcome = adapter.poll(&ProviderTaskId::new("pred-2")).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Failed {
            detail: "NSFW content detected".into()
        }
    );
}

#[tokio::test]
async fn replicate_client_error_is_rejected_and_server_error_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/models/black-forest-labs/flux-schnell/predictions"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid input"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/models/black-forest-labs/flux-dev/predictions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let adapter = ReplicateAdapter::new(client(), "t", server.uri());

    let mut p = GenerationParams::with_prompt("x");
    let err = adapter.submit(MediaKind::Image, &p).await.unwrap_err();
    assert_eq!(
        err,
        SubmissionError::Rejected {
            status: 422,
            message: "invalid input".into()
        }
    );

    p.model = Some("black-forest-labs/flux-dev".into());
    let err = adapter.submit(MediaKind::Image, &p).await.unwrap_err();
    assert!(matches!(err, SubmissionError::Unavailable(_)));
}

#[tokio::test]
async fn unlisted_model_is_refused_without_calling_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "x", "status": "starting"})))
        .expect(0)
        .mount(&server)
        .await;

    let adapter = ReplicateAdapter::new(client(), "t", server.uri());
    let mut p = GenerationParams::with_prompt("x");
    p.model = Some("black-forest-labs/flux-1.1-pro".into());
    let err = adapter.submit(MediaKind::Image, &p).await.unwrap_err();
    assert_eq!(
        err,
        SubmissionError::UnsupportedModel {
            provider: ProviderId::Replicate,
            model: "black-forest-labs/flux-1.1-pro".into()
        }
    );
}

#[tokio::test]
async fn fal_queue_round_trip() {
    let server = MockServer::start().await;
    let model = "fal-ai/kling-video/v2/master/text-to-video";

    Mock::given(method("POST"))
        .and(path(format!("/{model}")))
        .and(header("authorization", "Key fal-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "req-9"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{model}/requests/req-9/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "COMPLETED"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{model}/requests/req-9")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "video": {"url": "https://v3.fal.media/files/clip.mp4"}
        })))
        .mount(&server)
        .await;

    let adapter = FalAdapter::new(client(), "fal-key", server.uri());
    let task = adapter
        .submit(MediaKind::Video, &GenerationParams::with_prompt("surf").duration(5))
        .await
        .unwrap();
    assert_eq!(task.as_str(), format!("{model}#req-9"));

    assert_eq!(
        adapter.poll(&task).await.unwrap(),
        PollOutcome::Succeeded {
            asset_url: "https://v3.fal.media/files/clip.mp4".into()
        }
    );
}

#[tokio::test]
async fn fal_in_progress_is_waiting() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fal-ai/flux/dev/requests/r1/status"))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({"status": "IN_PROGRESS"})),
        )
        .mount(&server)
        .await;

    let adapter = FalAdapter::new(client(), "k", server.uri());
    let outcome = adapter
        .poll(&ProviderTaskId::new("fal-ai/flux/dev#r1"))
        .await
        .unwrap();
    assert_eq!(outcome, PollOutcome::Waiting);
}

#[tokio::test]
async fn taskapi_uploads_data_uri_then_creates_task() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/base64"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200, "msg": "ok",
            "data": {"downloadUrl": "https://files.taskapi.example/ref.png"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/jobs/createTask"))
        .and(body_partial_json(json!({
            "input": {"imageUrls": ["https://files.taskapi.example/ref.png", "https://cdn/x.png"]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200, "msg": "success", "data": {"taskId": "task-77"}
        })))
        .mount(&server)
        .await;

    let adapter = TaskApiAdapter::new(client(), "tk", server.uri());
    let params = GenerationParams::with_prompt("sneaker turntable")
        .reference("data:image/png;base64,iVBORw0KGgo=")
        .reference("https://cdn/x.png");
    let task = adapter.submit(MediaKind::MultiAngleSet, &params).await.unwrap();
    assert_eq!(task.as_str(), "task-77");
}

#[tokio::test]
async fn taskapi_application_error_code_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/jobs/createTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 422, "msg": "prompt too long", "data": null
        })))
        .mount(&server)
        .await;

    let adapter = TaskApiAdapter::new(client(), "tk", server.uri());
    let err = adapter
        .submit(MediaKind::Image, &GenerationParams::with_prompt("x"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SubmissionError::Rejected {
            status: 422,
            message: "prompt too long".into()
        }
    );
}

#[tokio::test]
async fn taskapi_result_json_string_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/recordInfo"))
        .and(query_param("taskId", "task-77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200, "msg": "success",
            "data": {
                "taskId": "task-77",
                "state": "success",
                "resultJson": "{\"resultUrls\":[\"https://files.taskapi.example/out.png\"]}"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/recordInfo"))
        .and(query_param("taskId", "task-78"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200, "msg": "success",
            "data": {"taskId": "task-78", "state": "fail", "failMsg": "content flagged"}
        })))
        .mount(&server)
        .await;

    let adapter = TaskApiAdapter::new(client(), "tk", server.uri());
    assert_eq!(
        adapter.poll(&ProviderTaskId::new("task-77")).await.unwrap(),
        PollOutcome::Succeeded {
            asset_url: "https://files.taskapi.example/out.png".into()
        }
    );
    assert_eq!(
        adapter.poll(&ProviderTaskId::new("task-78")).await.unwrap(),
        PollOutcome::Failed {
            detail: "content flagged".into()
        }
    );
}

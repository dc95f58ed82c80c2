//! 推論リクエストの転送（バッファ・ストリーミング・エラー）

use crate::support::backend::{
    endless_streaming_backend, ready_mock, resetting_backend, sleeping_backend, streaming_backend,
    unhealthy_mock,
};
use crate::support::service::{wait_for_status, TestService};
use futures::StreamExt;
use llmsv::common::SvError;
use llmsv::proxy::{InferenceEndpoint, ProxyRequest, ProxyResponse};
use llmsv::supervisor::LaunchMode;
use llmsv::types::{DeploymentSpec, DeploymentStatus};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

fn chat(payload: serde_json::Value) -> ProxyRequest {
    ProxyRequest::new(InferenceEndpoint::ChatCompletions, payload)
}

async fn deploy(t: &TestService, identity: &str, port: u16) {
    t.service
        .register(
            DeploymentSpec::new(identity).with_port(port),
            LaunchMode::Background,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn buffered_request_is_forwarded_verbatim() {
    let mock = ready_mock().await;
    let payload = json!({
        "model": "Qwen2-7B",
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0.2
    });
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let t = TestService::new(sleeping_backend());
    deploy(&t, "Qwen/Qwen2-7B", mock.address().port()).await;
    wait_for_status(&t.service, "Qwen2-7B", DeploymentStatus::Ready).await;

    let mut request = chat(payload);
    request.authorization = Some("Bearer sk-test".to_string());
    let response = t.service.route("Qwen2-7B", request).await.unwrap();

    let ProxyResponse::Buffered { status, body, .. } = response else {
        panic!("expected buffered response");
    };
    assert_eq!(status, 200);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    mock.verify().await;
    t.service.shutdown().await;
}

#[tokio::test]
async fn streamed_chunks_arrive_in_order_and_the_stream_closes() {
    let chunks = [
        "data: {\"delta\":\"Hel\"}\n\n",
        "data: {\"delta\":\"lo\"}\n\n",
        "data: [DONE]\n\n",
    ];
    let backend = streaming_backend(&chunks, Duration::from_millis(30)).await;
    let t = TestService::new(sleeping_backend());
    deploy(&t, "org/stream", backend.port()).await;
    wait_for_status(&t.service, "org/stream", DeploymentStatus::Ready).await;

    let response = t
        .service
        .route("org/stream", chat(json!({"model": "org/stream", "stream": true})))
        .await
        .unwrap();
    assert!(response.is_streamed());
    let ProxyResponse::Streamed {
        content_type,
        mut stream,
        ..
    } = response
    else {
        unreachable!();
    };
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));

    let mut received = Vec::new();
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
    })
    .await;
    assert!(collected.is_ok(), "stream did not close");
    assert_eq!(String::from_utf8(received).unwrap(), chunks.concat());

    t.service.shutdown().await;
    backend.stop().await;
}

#[tokio::test]
async fn not_ready_deployment_gets_no_outbound_request() {
    let mock = unhealthy_mock().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock)
        .await;

    let t = TestService::with(sleeping_backend(), |config| {
        config.supervisor.readiness.initial_attempts = 1000;
    });
    deploy(&t, "org/m", mock.address().port()).await;

    let err = t
        .service
        .route("m", chat(json!({"model": "m"})))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.status_code(), 503);
    assert!(matches!(
        err,
        SvError::NotReady { status: DeploymentStatus::Loading, .. }
    ));

    mock.verify().await;
    t.service.shutdown().await;
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let t = TestService::new(sleeping_backend());
    let err = t
        .service
        .route("ghost", chat(json!({"model": "ghost"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SvError::NotFound(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn backend_error_status_and_body_are_passed_through() {
    let mock = ready_mock().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"object": "error", "message": "prompt too long"})),
        )
        .mount(&mock)
        .await;

    let t = TestService::new(sleeping_backend());
    deploy(&t, "org/m", mock.address().port()).await;
    wait_for_status(&t.service, "org/m", DeploymentStatus::Ready).await;

    let request = ProxyRequest::new(
        InferenceEndpoint::Completions,
        json!({"model": "org/m", "prompt": "..."}),
    );
    let err = t.service.route("org/m", request).await.unwrap_err();
    let SvError::Upstream { status, body, .. } = err else {
        panic!("expected upstream error, got {err:?}");
    };
    assert_eq!(status, 400);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["message"], "prompt too long");
    t.service.shutdown().await;
}

#[tokio::test]
async fn stopped_backend_is_unavailable() {
    let backend = streaming_backend(&["data: [DONE]\n\n"], Duration::from_millis(1)).await;
    let t = TestService::new(sleeping_backend());
    deploy(&t, "org/m", backend.port()).await;
    wait_for_status(&t.service, "org/m", DeploymentStatus::Ready).await;

    backend.stop().await;

    let err = t
        .service
        .route("org/m", chat(json!({"model": "org/m"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SvError::Unavailable(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(err.client_message(), "Model server unavailable");

    // レコードはreadyのまま（ヘルスの再判定はしない）
    assert_eq!(
        t.service.lookup("org/m").await.unwrap().status,
        DeploymentStatus::Ready
    );
    t.service.shutdown().await;
}

#[tokio::test]
async fn unregistering_ends_an_in_flight_stream() {
    let backend = endless_streaming_backend(Duration::from_millis(20)).await;
    let t = TestService::new(sleeping_backend());
    deploy(&t, "org/live", backend.port()).await;
    wait_for_status(&t.service, "org/live", DeploymentStatus::Ready).await;

    let response = t
        .service
        .route("org/live", chat(json!({"model": "org/live", "stream": true})))
        .await
        .unwrap();
    let ProxyResponse::Streamed { mut stream, .. } = response else {
        panic!("expected streamed response");
    };
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap();
    assert!(matches!(first, Some(Ok(_))));

    t.service.unregister("org/live").await.unwrap();

    // 削除で打ち切られたストリームは Unavailable で終わる
    let last = tokio::time::timeout(Duration::from_secs(5), async {
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item);
        }
        last
    })
    .await
    .expect("stream kept running after unregister");
    assert!(
        matches!(last, Some(Err(SvError::Unavailable(_)))),
        "got {last:?}"
    );
    assert!(matches!(
        t.service.route("org/live", chat(json!({}))).await,
        Err(SvError::NotFound(_))
    ));
    drop(stream);
    backend.stop().await;
}

#[tokio::test]
async fn backend_reset_mid_stream_ends_with_unavailable() {
    let first = "data: {\"delta\":\"Hel\"}\n\n";
    let backend = resetting_backend(first).await;
    let t = TestService::new(sleeping_backend());
    deploy(&t, "org/flaky", backend.port()).await;
    wait_for_status(&t.service, "org/flaky", DeploymentStatus::Ready).await;

    let response = t
        .service
        .route("org/flaky", chat(json!({"model": "org/flaky", "stream": true})))
        .await
        .unwrap();
    let ProxyResponse::Streamed { mut stream, .. } = response else {
        panic!("expected streamed response");
    };

    let (received, error) = tokio::time::timeout(Duration::from_secs(5), async {
        let mut received = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(e) => return (received, Some(e)),
            }
        }
        (received, None)
    })
    .await
    .expect("stream did not end after the backend reset");

    assert_eq!(String::from_utf8(received).unwrap(), first);
    assert!(matches!(error, Some(SvError::Unavailable(_))), "got {error:?}");
    drop(stream);
    t.service.shutdown().await;
    backend.stop().await;
}

#[tokio::test]
async fn backend_reset_mid_body_is_unavailable() {
    let backend = resetting_backend("{\"id\": \"chatcmpl-1\", \"choi").await;
    let t = TestService::new(sleeping_backend());
    deploy(&t, "org/flaky", backend.port()).await;
    wait_for_status(&t.service, "org/flaky", DeploymentStatus::Ready).await;

    let err = t
        .service
        .route("org/flaky", chat(json!({"model": "org/flaky"})))
        .await
        .unwrap_err();
    assert!(matches!(err, SvError::Unavailable(_)), "got {err:?}");
    assert_eq!(err.status_code(), 503);
    t.service.shutdown().await;
    backend.stop().await;
}

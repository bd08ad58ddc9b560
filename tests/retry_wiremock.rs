use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crucible_harness::gateway::openrouter::OpenRouterAdapter;
use crucible_harness::gateway::{
    Attribution, ChatModel, ChatRequest, Message, NoopUsageSink, ProviderGateway,
};
use crucible_harness::retry::{
    call_with_retry, CategoryPolicy, ErrorCategory, RetryPolicyEngine,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Fails with the given status/body a fixed number of times, then succeeds.
struct FlakyProvider {
    failures: u32,
    status: u16,
    body: serde_json::Value,
    calls: Arc<AtomicU32>,
}

impl Respond for FlakyProvider {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            ResponseTemplate::new(self.status).set_body_json(self.body.clone())
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "recovered" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 5, "completion_tokens": 5 }
            }))
        }
    }
}

/// Engine with zero backoff delays so tests run fast.
fn fast_engine() -> RetryPolicyEngine {
    let instant = |max_retries| CategoryPolicy {
        max_retries,
        base_delay_ms: 0,
        max_delay_ms: 0,
        multiplier: 1.0,
        jitter: false,
        enhance_prompt: false,
    };
    RetryPolicyEngine::default()
        .with_policy(ErrorCategory::RateLimited, instant(4))
        .with_policy(ErrorCategory::ServerError, instant(3))
        .with_policy(ErrorCategory::Network, instant(3))
}

async fn gateway_for(server: &MockServer) -> Arc<ProviderGateway<NoopUsageSink>> {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    Arc::new(ProviderGateway::new(adapter, Arc::new(NoopUsageSink)))
}

fn request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter("test/model"),
        vec![Message::user("hello")],
        Attribution::new("test"),
    )
}

#[tokio::test]
async fn rate_limit_is_retried_until_success() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyProvider {
            failures: 2,
            status: 429,
            body: json!({"error": {"message": "rate limit exceeded, too many requests"}}),
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let engine = fast_engine();
    let response = call_with_retry(&engine, |_ctx| {
        let gateway = gateway.clone();
        async move { gateway.chat(request()).await }
    })
    .await
    .unwrap();

    assert_eq!(response.content, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn quota_exhaustion_fails_on_first_attempt() {
    // Delivered with the same 429 as a rate limit, but the body says the
    // quota is gone, so no amount of waiting will help.
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyProvider {
            failures: 10,
            status: 429,
            body: json!({"error": {"message": "insufficient_quota: please check your plan"}}),
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let engine = fast_engine();
    let err = call_with_retry(&engine, |_ctx| {
        let gateway = gateway.clone();
        async move { gateway.chat(request()).await }
    })
    .await
    .unwrap_err();

    assert_eq!(err.category, ErrorCategory::QuotaExhausted);
    assert_eq!(err.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_errors_are_retried_then_exhausted()
{
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyProvider {
            failures: 10,
            status: 503,
            body: json!({"error": {"message": "service unavailable"}}),
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let engine = fast_engine();
    let err = call_with_retry(&engine, |_ctx| {
        let gateway = gateway.clone();
        async move { gateway.chat(request()).await }
    })
    .await
    .unwrap_err();

    assert_eq!(err.category, ErrorCategory::ServerError);
    // Initial attempt plus three retries.
    assert_eq!(err.attempts, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn auth_failure_is_never_retried() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyProvider {
            failures: 10,
            status: 401,
            body: json!({"error": {"message": "invalid api key"}}),
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let engine = fast_engine();
    let err = call_with_retry(&engine, |_ctx| {
        let gateway = gateway.clone();
        async move { gateway.chat(request()).await }
    })
    .await
    .unwrap_err();

    assert_eq!(err.category, ErrorCategory::AuthFailure);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_choices_classify_as_empty_response_and_recover() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU32::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyProvider {
            failures: 1,
            status: 200,
            body: json!({"choices": [], "usage": {"prompt_tokens": 1, "completion_tokens": 0}}),
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let engine = fast_engine().with_policy(
        ErrorCategory::EmptyResponse,
        CategoryPolicy {
            max_retries: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
            enhance_prompt: false,
        },
    );
    let response = call_with_retry(&engine, |_ctx| {
        let gateway = gateway.clone();
        async move { gateway.chat(request()).await }
    })
    .await
    .unwrap();

    assert_eq!(response.content, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

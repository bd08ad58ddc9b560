use std::sync::Arc;
use std::time::Duration;

use crucible_harness::combine::{Combiner, RankedReport};
use crucible_harness::config::{CombineSettings, CombineStrategy};
use crucible_harness::gateway::openrouter::OpenRouterAdapter;
use crucible_harness::gateway::{NoopUsageSink, ProviderGateway};
use crucible_harness::retry::{CategoryPolicy, ErrorCategory, RetryPolicyEngine};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn report(id: &str, model: &str, content: &str) -> RankedReport {
    RankedReport {
        artifact_id: id.to_string(),
        model: model.to_string(),
        content: content.to_string(),
        score: Some(7.0),
    }
}

fn fast_engine() -> RetryPolicyEngine {
    RetryPolicyEngine::default().with_policy(
        ErrorCategory::ServerError,
        CategoryPolicy {
            max_retries: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
            enhance_prompt: false,
        },
    )
}

#[tokio::test]
async fn concatenate_output_contains_every_source_report() {
    let combiner = Combiner::new(None, RetryPolicyEngine::default());
    let reports = vec![
        report("a1", "m1", "first report body"),
        report("a2", "m2", "second report body"),
        report("a3", "m3", "third report body"),
    ];
    let settings = CombineSettings {
        enabled: true,
        strategy: CombineStrategy::Concatenate,
        ..CombineSettings::default()
    };
    let result = combiner
        .combine(Uuid::new_v4(), "doc-1", "q", &reports, &settings)
        .await
        .unwrap();

    // Nothing is dropped: the concatenation is at least as long as the sum
    // of its inputs.
    let total: usize = reports.iter().map(|r| r.content.len()).sum();
    assert!(result.content.len() >= total);
    for r in &reports {
        assert!(result.content.contains(&r.content));
    }
    assert_eq!(result.strategy_used, CombineStrategy::Concatenate);
    assert!(result.fallback_reason.is_none());
}

#[tokio::test]
async fn section_assembly_single_report_is_verbatim() {
    let combiner = Combiner::new(None, RetryPolicyEngine::default());
    let content = "# Summary\nBody text.\n\n# Detail\nMore text.";
    let settings = CombineSettings {
        enabled: true,
        strategy: CombineStrategy::SectionAssembly,
        ..CombineSettings::default()
    };
    let result = combiner
        .combine(
            Uuid::new_v4(),
            "doc-1",
            "q",
            &[report("a1", "m1", content)],
            &settings,
        )
        .await
        .unwrap();
    assert_eq!(result.content, content);
}

#[tokio::test]
async fn transient_merge_failure_degrades_to_concatenate_with_reason() {
    // The merge model is down (503 on every attempt). After retries the
    // combine must still deliver output, via concatenation, and say why.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({"error": {"message": "service unavailable"}})),
        )
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = Arc::new(ProviderGateway::new(adapter, Arc::new(NoopUsageSink)));
    let combiner = Combiner::new(Some(gateway), fast_engine());

    let reports = vec![
        report("a1", "m1", "alpha report"),
        report("a2", "m2", "beta report"),
    ];
    let settings = CombineSettings {
        enabled: true,
        strategy: CombineStrategy::IntelligentMerge,
        model: Some("merge/model".into()),
        synthesis_instruction: Some("Merge the reports.".into()),
        ..CombineSettings::default()
    };

    let result = combiner
        .combine(Uuid::new_v4(), "doc-1", "q", &reports, &settings)
        .await
        .unwrap();

    assert_eq!(result.requested_strategy, CombineStrategy::IntelligentMerge);
    assert_eq!(result.strategy_used, CombineStrategy::Concatenate);
    let reason = result.fallback_reason.as_deref().unwrap();
    assert!(reason.contains("ServerError"), "reason was: {reason}");
    assert!(result.content.contains("alpha report"));
    assert!(result.content.contains("beta report"));
}

#[tokio::test]
async fn successful_merge_keeps_requested_strategy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "one unified document" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 40, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = Arc::new(ProviderGateway::new(adapter, Arc::new(NoopUsageSink)));
    let combiner = Combiner::new(Some(gateway), RetryPolicyEngine::default());

    let reports = vec![
        report("a1", "m1", "alpha report"),
        report("a2", "m2", "beta report"),
    ];
    let settings = CombineSettings {
        enabled: true,
        strategy: CombineStrategy::IntelligentMerge,
        model: Some("merge/model".into()),
        synthesis_instruction: Some("Merge the reports.".into()),
        ..CombineSettings::default()
    };

    let result = combiner
        .combine(Uuid::new_v4(), "doc-1", "q", &reports, &settings)
        .await
        .unwrap();
    assert_eq!(result.strategy_used, CombineStrategy::IntelligentMerge);
    assert_eq!(result.content, "one unified document");
    assert!(result.fallback_reason.is_none());
    assert!(result.cost_nanodollars > 0);
}

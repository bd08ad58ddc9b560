use std::sync::Arc;
use std::time::Duration;

use crucible_harness::config::{
    DocumentSpec, EloSettings, EvalSettings, GeneratorSpec, PairwiseSettings, RunConfig,
};
use crucible_harness::gateway::{ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError};
use crucible_harness::progress::NoopProgressSink;
use crucible_harness::retry::RetryPolicyEngine;
use crucible_harness::task::Artifact;
use crucible_harness::tournament::{
    apply_all, expected_score, PairwiseComparison, Rating, Tournament,
};
use uuid::Uuid;

fn config() -> RunConfig {
    RunConfig {
        run_id: Uuid::new_v4(),
        documents: vec![DocumentSpec {
            id: "doc-1".into(),
            query: "q".into(),
            context: None,
        }],
        generators: vec![GeneratorSpec {
            id: "report".into(),
            instructions: "i".into(),
            prompt_template_slug: None,
        }],
        models: vec!["m".into()],
        generation_iterations: 1,
        temperature: 0.0,
        evaluation: EvalSettings {
            enabled: true,
            judge_models: vec!["judge/one".into()],
            iterations: 1,
            criteria: vec!["accuracy".into()],
        },
        pairwise: PairwiseSettings {
            enabled: true,
            top_n: Some(3),
        },
        combine: Default::default(),
        post_combine_eval: false,
        elo: EloSettings::default(),
        generation_concurrency: 2,
        evaluation_concurrency: 2,
        call_timeout_ms: 5_000,
        wall_clock_ceiling_ms: 60_000,
    }
}

fn artifact(id: &str, content: &str) -> Artifact {
    Artifact {
        id: id.to_string(),
        document_id: "doc-1".to_string(),
        generator_id: "report".to_string(),
        model: "m".to_string(),
        iteration: 1,
        content: content.to_string(),
    }
}

/// Judge that always prefers the lexicographically larger document body.
struct LexJudge;

fn extract_between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_idx = s.find(start)? + start.len();
    let rest = &s[start_idx..];
    let end_idx = rest.find(end)?;
    Some(&rest[..end_idx])
}

#[async_trait::async_trait]
impl ChatGateway for LexJudge {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let user = req
            .messages
            .iter()
            .find(|m| m.role == crucible_harness::gateway::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let a = extract_between(user, "<document_A>", "</document_A>").unwrap_or("");
        let b = extract_between(user, "<document_B>", "</document_B>").unwrap_or("");
        let winner = if a.trim() > b.trim() { "A" } else { "B" };
        Ok(ChatResponse {
            content: format!(r#"{{"winner": "{winner}", "reason": "lexicographic"}}"#),
            reasoning: None,
            input_tokens: 1,
            output_tokens: 1,
            cost_nanodollars: 50,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

#[tokio::test]
async fn three_candidates_one_judge_is_three_comparisons() {
    let artifacts = vec![
        artifact("a1", "charlie body"),
        artifact("a2", "bravo body"),
        artifact("a3", "alpha body"),
    ];
    let order: Vec<String> = artifacts.iter().map(|a| a.id.clone()).collect();
    let tournament = Tournament::new(
        Arc::new(LexJudge),
        RetryPolicyEngine::default(),
        Arc::new(NoopProgressSink),
    );
    let cfg = config();
    let result = tournament.run(&cfg, &artifacts, &order, None).await;

    // C(3,2) pairs, one judge each.
    assert_eq!(result.comparisons.len(), 3);
    assert_eq!(result.ratings.len(), 3);

    // "charlie" beats everything, so a1 ends on top with two wins.
    let a1 = result
        .ratings
        .iter()
        .find(|r| r.artifact_id == "a1")
        .unwrap();
    assert_eq!(a1.wins, 2);
    assert_eq!(a1.losses, 0);
    assert!(result
        .ratings
        .iter()
        .all(|r| r.artifact_id == "a1" || r.elo < a1.elo));
}

#[tokio::test]
async fn single_candidate_plays_no_games() {
    let artifacts = vec![artifact("a1", "only")];
    let tournament = Tournament::new(
        Arc::new(LexJudge),
        RetryPolicyEngine::default(),
        Arc::new(NoopProgressSink),
    );
    let cfg = config();
    let result = tournament
        .run(&cfg, &artifacts, &["a1".to_string()], None)
        .await;
    assert!(result.comparisons.is_empty());
    assert_eq!(result.ratings.len(), 1);
    assert_eq!(result.ratings[0].elo, cfg.elo.initial_rating);
}

#[test]
fn expected_scores_are_complementary() {
    for (a, b) in [(1000.0, 1000.0), (1480.0, 975.0), (600.0, 2200.0)] {
        assert!((expected_score(a, b) + expected_score(b, a) - 1.0).abs() < 1e-12);
    }
}

#[test]
fn identical_verdicts_in_identical_order_are_reproducible() {
    let fresh = || -> Vec<Rating> {
        ["a", "b", "c"]
            .iter()
            .map(|id| Rating {
                artifact_id: id.to_string(),
                elo: 1000.0,
                wins: 0,
                losses: 0,
            })
            .collect()
    };
    let decided = |a: &str, b: &str, w: &str| PairwiseComparison {
        artifact_a: a.to_string(),
        artifact_b: b.to_string(),
        judge_model: "j".to_string(),
        winner: Some(w.to_string()),
        reason: String::new(),
        cost_nanodollars: 0,
    };
    let comparisons = vec![
        decided("a", "b", "b"),
        decided("a", "c", "a"),
        decided("b", "c", "b"),
    ];
    let settings = EloSettings::default();

    let mut first = fresh();
    apply_all(&mut first, &comparisons, &settings);
    let mut second = fresh();
    apply_all(&mut second, &comparisons, &settings);

    for (x, y) in first.iter().zip(second.iter()) {
        assert_eq!(x.elo.to_bits(), y.elo.to_bits());
        assert_eq!(x.wins, y.wins);
    }
}

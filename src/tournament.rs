//! Pairwise Elo tournament.
//!
//! Candidates (optionally the top-N by single-document score) play a
//! round-robin: every unordered pair is judged once per judge model. Verdicts
//! are collected concurrently but ratings are applied sequentially in a
//! deterministic resolution order, so the final standings are reproducible
//! for a given set of verdicts.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::config::{EloSettings, RunConfig};
use crate::eval::extract_json;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::progress::{ProgressEvent, ProgressKind, ProgressSink};
use crate::prompts::render_pairwise;
use crate::retry::{call_with_retry, RetryPolicyEngine};
use crate::task::Artifact;

// =============================================================================
// TYPES
// =============================================================================

/// One artifact's tournament standing.
#[derive(Debug, Clone, Serialize)]
pub struct Rating {
    pub artifact_id: String,
    pub elo: f64,
    pub wins: u32,
    pub losses: u32,
}

/// One judged pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairwiseComparison {
    pub artifact_a: String,
    pub artifact_b: String,
    pub judge_model: String,
    /// Winning artifact id. None when the judge declined to pick; such
    /// comparisons are recorded but never move ratings.
    pub winner: Option<String>,
    pub reason: String,
    pub cost_nanodollars: i64,
}

/// Expected score of A against B under the Elo model.
///
/// `expected(a, b) + expected(b, a) == 1.0` for any pair of ratings.
pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
}

/// Apply one decided comparison to the ratings table.
///
/// No-ops when the comparison has no winner or names an unknown artifact.
pub fn apply_comparison(
    ratings: &mut [Rating],
    comparison: &PairwiseComparison,
    settings: &EloSettings,
) {
    let Some(winner_id) = comparison.winner.as_deref() else {
        return;
    };
    let loser_id = if winner_id == comparison.artifact_a {
        comparison.artifact_b.as_str()
    } else if winner_id == comparison.artifact_b {
        comparison.artifact_a.as_str()
    } else {
        return;
    };

    let Some(w_idx) = ratings.iter().position(|r| r.artifact_id == winner_id) else {
        return;
    };
    let Some(l_idx) = ratings.iter().position(|r| r.artifact_id == loser_id) else {
        return;
    };

    let e_w = expected_score(ratings[w_idx].elo, ratings[l_idx].elo);
    let e_l = expected_score(ratings[l_idx].elo, ratings[w_idx].elo);

    ratings[w_idx].elo += settings.k_factor * (1.0 - e_w);
    ratings[w_idx].wins += 1;
    ratings[l_idx].elo += settings.k_factor * (0.0 - e_l);
    ratings[l_idx].losses += 1;
}

/// Resolve all comparisons sequentially in slice order.
pub fn apply_all(
    ratings: &mut [Rating],
    comparisons: &[PairwiseComparison],
    settings: &EloSettings,
) {
    for c in comparisons {
        apply_comparison(ratings, c, settings);
    }
}

/// Pick the tournament winner: highest Elo, ties broken by wins, then by
/// ratings-table order (first seen).
pub fn winner(ratings: &[Rating]) -> Option<&Rating> {
    let mut best: Option<&Rating> = None;
    for r in ratings {
        let better = match best {
            None => true,
            Some(b) => r.elo > b.elo || (r.elo == b.elo && r.wins > b.wins),
        };
        if better {
            best = Some(r);
        }
    }
    best
}

// =============================================================================
// PAIR EXPANSION
// =============================================================================

/// All unordered candidate pairs crossed with every judge, in deterministic
/// candidate order.
fn expand_pairs<'a>(
    candidates: &'a [&'a Artifact],
    judges: &'a [String],
) -> Vec<(&'a Artifact, &'a Artifact, &'a str)> {
    let mut pairs = Vec::new();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            for judge in judges {
                pairs.push((candidates[i], candidates[j], judge.as_str()));
            }
        }
    }
    pairs
}

// =============================================================================
// PARSING
// =============================================================================

#[derive(Deserialize)]
struct VerdictJson {
    winner: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse a judge verdict. Returns the winning side (or None for a declared
/// tie) plus the judge's reason.
fn parse_verdict(raw: &str) -> Result<(Option<char>, String), String> {
    let json_str = extract_json(raw);
    let parsed: VerdictJson = serde_json::from_str(json_str).map_err(|e| e.to_string())?;
    let reason = parsed.reason.unwrap_or_default();
    match parsed.winner.as_deref().map(str::trim) {
        Some("A") | Some("a") => Ok((Some('A'), reason)),
        Some("B") | Some("b") => Ok((Some('B'), reason)),
        None => Ok((None, reason)),
        Some(other) => Err(format!("invalid winner value: {other:?}")),
    }
}

// =============================================================================
// TOURNAMENT
// =============================================================================

/// Runs the round-robin and resolves ratings.
pub struct Tournament {
    gateway: Arc<dyn ChatGateway>,
    retry: RetryPolicyEngine,
    progress: Arc<dyn ProgressSink>,
}

/// Output of one tournament run.
#[derive(Debug, Clone, Serialize)]
pub struct TournamentResult {
    /// All judged pairs in resolution order, winnerless ones included.
    pub comparisons: Vec<PairwiseComparison>,
    /// Final standings in candidate order.
    pub ratings: Vec<Rating>,
}

impl Tournament {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        retry: RetryPolicyEngine,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            gateway,
            retry,
            progress,
        }
    }

    /// Run the round-robin over the given candidates.
    ///
    /// `candidate_order` restricts and orders the field (top-N cutoff is the
    /// caller truncating this list). Failed judge calls drop that comparison;
    /// they never abort the phase.
    pub async fn run(
        &self,
        config: &RunConfig,
        artifacts: &[Artifact],
        candidate_order: &[String],
        cancel: Option<&AtomicBool>,
    ) -> TournamentResult {
        let candidates: Vec<&Artifact> = candidate_order
            .iter()
            .filter_map(|id| artifacts.iter().find(|a| &a.id == id))
            .collect();

        let mut ratings: Vec<Rating> = candidates
            .iter()
            .map(|a| Rating {
                artifact_id: a.id.clone(),
                elo: config.elo.initial_rating,
                wins: 0,
                losses: 0,
            })
            .collect();

        if candidates.len() < 2 {
            return TournamentResult {
                comparisons: Vec::new(),
                ratings,
            };
        }

        let pairs = expand_pairs(&candidates, &config.evaluation.judge_models);

        // Verdicts arrive in completion order; resolution order is pair
        // expansion order, restored by index before ratings are applied.
        let mut indexed: Vec<(usize, Option<PairwiseComparison>)> =
            stream::iter(pairs.into_iter().enumerate().map(|(idx, (a, b, judge))| async move {
                if cancel
                    .map(|f| f.load(AtomicOrdering::Relaxed))
                    .unwrap_or(false)
                {
                    return (idx, None);
                }
                let outcome = self.compare(config, a, b, judge).await;
                match &outcome {
                    Some(c) => {
                        let kind = if c.winner.is_some() {
                            ProgressKind::ComparisonResolved
                        } else {
                            ProgressKind::ComparisonDiscarded
                        };
                        self.progress.publish(
                            ProgressEvent::new(config.run_id, kind, "pairwise")
                                .artifact(c.winner.clone().unwrap_or_else(|| c.artifact_a.clone()))
                                .message(format!("{} vs {} ({judge})", c.artifact_a, c.artifact_b)),
                        );
                    }
                    None => {
                        self.progress.publish(
                            ProgressEvent::new(
                                config.run_id,
                                ProgressKind::ComparisonDiscarded,
                                "pairwise",
                            )
                            .message(format!("{} vs {} ({judge}): judge call failed", a.id, b.id)),
                        );
                    }
                }
                (idx, outcome)
            }))
            .buffer_unordered(config.evaluation_concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        let comparisons: Vec<PairwiseComparison> =
            indexed.into_iter().filter_map(|(_, c)| c).collect();

        apply_all(&mut ratings, &comparisons, &config.elo);

        TournamentResult {
            comparisons,
            ratings,
        }
    }

    async fn compare(
        &self,
        config: &RunConfig,
        a: &Artifact,
        b: &Artifact,
        judge: &str,
    ) -> Option<PairwiseComparison> {
        let query = config
            .documents
            .iter()
            .find(|d| d.id == a.document_id)
            .map(|d| d.query.as_str())
            .unwrap_or("");
        let call_timeout = config.call_timeout();

        let result = call_with_retry(&self.retry, |_ctx| {
            let gateway = self.gateway.clone();
            let prompt = render_pairwise(query, &a.content, &b.content);
            let judge = judge.to_string();
            let run_id = config.run_id;
            async move {
                let request = ChatRequest::new(
                    ChatModel::openrouter(judge),
                    prompt.to_messages(),
                    Attribution::new("tournament::compare").with_run(run_id),
                )
                .json();

                let response = match timeout(call_timeout, gateway.chat(request)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(ProviderError::Timeout(call_timeout, None)),
                };

                let verdict = parse_verdict(&response.content)
                    .map_err(|e| ProviderError::empty_response(e))?;
                Ok((verdict, response.cost_nanodollars))
            }
        })
        .await;

        match result {
            Ok(((side, reason), cost)) => {
                let winner = side.map(|s| {
                    if s == 'A' {
                        a.id.clone()
                    } else {
                        b.id.clone()
                    }
                });
                Some(PairwiseComparison {
                    artifact_a: a.id.clone(),
                    artifact_b: b.id.clone(),
                    judge_model: judge.to_string(),
                    winner,
                    reason,
                    cost_nanodollars: cost,
                })
            }
            Err(err) => {
                tracing::warn!(
                    artifact_a = %a.id,
                    artifact_b = %b.id,
                    judge,
                    error = %err,
                    "Pairwise comparison failed"
                );
                None
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Single-document judge evaluation and aggregation.
//!
//! Each artifact is scored by every judge model for the configured number of
//! iterations. One judge call yields one [`JudgeEvaluation`] with per-criterion
//! scores in config order. Aggregation is an average of evaluation averages,
//! so a judge that failed contributes nothing rather than zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::config::RunConfig;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::progress::{ProgressEvent, ProgressKind, ProgressSink};
use crate::prompts::render_judge;
use crate::retry::{call_with_retry, RetryPolicyEngine};
use crate::task::Artifact;

/// Error type for evaluation operations.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Parse error: {0}")]
    Parse(String),
}

// =============================================================================
// TYPES
// =============================================================================

/// One criterion's score from one judge call.
#[derive(Debug, Clone, Serialize)]
pub struct CriterionScore {
    pub criterion: String,
    /// 0-10, clamped.
    pub score: f64,
    pub reason: Option<String>,
}

/// One judge call over one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeEvaluation {
    pub artifact_id: String,
    pub judge_model: String,
    /// 1-based iteration index.
    pub iteration: usize,
    /// Scores in config criteria order.
    pub scores: Vec<CriterionScore>,
    /// Mean over this call's criterion scores.
    pub average: f64,
    pub cost_nanodollars: i64,
}

/// Aggregated standing of one artifact across all its evaluations.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentEvalSummary {
    pub artifact_id: String,
    pub evaluation_count: usize,
    /// Mean of per-evaluation averages. Judges that failed are absent, not
    /// zero, so partial coverage does not drag the score down.
    pub average_score: f64,
    /// Per-criterion means, config order.
    pub criterion_averages: Vec<(String, f64)>,
}

/// What the evaluator scores: an artifact or a combined output.
#[derive(Debug, Clone)]
pub struct EvalTarget {
    pub artifact_id: String,
    pub query: String,
    pub content: String,
}

/// Build eval targets from completed artifacts, resolving each document's
/// query from the run config.
pub fn targets_from_artifacts(config: &RunConfig, artifacts: &[Artifact]) -> Vec<EvalTarget> {
    artifacts
        .iter()
        .filter_map(|a| {
            config
                .documents
                .iter()
                .find(|d| d.id == a.document_id)
                .map(|d| EvalTarget {
                    artifact_id: a.id.clone(),
                    query: d.query.clone(),
                    content: a.content.clone(),
                })
        })
        .collect()
}

// =============================================================================
// PARSING
// =============================================================================

#[derive(Deserialize)]
struct JudgeJson {
    scores: Vec<JudgeScoreJson>,
}

#[derive(Deserialize)]
struct JudgeScoreJson {
    criterion: String,
    score: f64,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse a judge response into scores aligned to the configured criteria.
///
/// Criterion names match case-insensitively; every configured criterion must
/// be present or the response is rejected (and the call retried upstream as
/// an empty-response-shaped failure).
pub fn parse_judge_response(raw: &str, criteria: &[String]) -> Result<Vec<CriterionScore>, EvalError> {
    let json_str = extract_json(raw);
    let parsed: JudgeJson =
        serde_json::from_str(json_str).map_err(|e| EvalError::Parse(e.to_string()))?;

    let mut out = Vec::with_capacity(criteria.len());
    for criterion in criteria {
        let found = parsed
            .scores
            .iter()
            .find(|s| s.criterion.eq_ignore_ascii_case(criterion))
            .ok_or_else(|| EvalError::Parse(format!("missing score for '{criterion}'")))?;
        if !found.score.is_finite() {
            return Err(EvalError::Parse(format!(
                "non-finite score for '{criterion}'"
            )));
        }
        out.push(CriterionScore {
            criterion: criterion.clone(),
            score: found.score.clamp(0.0, 10.0),
            reason: found.reason.clone(),
        });
    }
    Ok(out)
}

/// Extract the first balanced JSON object from a response (handles models
/// that add surrounding text). Shared with pairwise verdict parsing.
pub(crate) fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0;
        for (i, c) in remainder.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }
    trimmed
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    (n > 0).then(|| sum / n as f64)
}

// =============================================================================
// AGGREGATION
// =============================================================================

/// Aggregate evaluations into one summary per artifact.
///
/// Artifacts with zero successful evaluations get no summary at all.
/// Output order follows first appearance in `evaluations`.
pub fn summarize(evaluations: &[JudgeEvaluation], criteria: &[String]) -> Vec<DocumentEvalSummary> {
    let mut order: Vec<&str> = Vec::new();
    for e in evaluations {
        if !order.contains(&e.artifact_id.as_str()) {
            order.push(&e.artifact_id);
        }
    }

    order
        .into_iter()
        .filter_map(|artifact_id| {
            let evals: Vec<&JudgeEvaluation> = evaluations
                .iter()
                .filter(|e| e.artifact_id == artifact_id)
                .collect();
            let average_score = mean(evals.iter().map(|e| e.average))?;
            let criterion_averages = criteria
                .iter()
                .filter_map(|c| {
                    mean(evals.iter().flat_map(|e| {
                        e.scores
                            .iter()
                            .filter(|s| &s.criterion == c)
                            .map(|s| s.score)
                    }))
                    .map(|m| (c.clone(), m))
                })
                .collect();
            Some(DocumentEvalSummary {
                artifact_id: artifact_id.to_string(),
                evaluation_count: evals.len(),
                average_score,
                criterion_averages,
            })
        })
        .collect()
}

/// Artifact ids ranked by summary average, descending. Ties keep summary
/// order, which is first-appearance order.
pub fn rank_by_summary(summaries: &[DocumentEvalSummary]) -> Vec<String> {
    let mut ranked: Vec<&DocumentEvalSummary> = summaries.iter().collect();
    ranked.sort_by(|a, b| {
        b.average_score
            .partial_cmp(&a.average_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.into_iter().map(|s| s.artifact_id.clone()).collect()
}

// =============================================================================
// EVALUATOR
// =============================================================================

/// Runs judge calls with bounded concurrency.
pub struct Evaluator {
    gateway: Arc<dyn ChatGateway>,
    retry: RetryPolicyEngine,
    progress: Arc<dyn ProgressSink>,
}

impl Evaluator {
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

    /// Score every target with every judge for the configured iterations.
    ///
    /// Failed judge calls are dropped after retries; they surface as progress
    /// events and a smaller evaluation set, never as a phase abort.
    pub async fn evaluate(
        &self,
        config: &RunConfig,
        targets: &[EvalTarget],
        cancel: Option<&AtomicBool>,
    ) -> Vec<JudgeEvaluation> {
        let judges = &config.evaluation.judge_models;
        let iterations = config.evaluation.iterations;

        let mut jobs = Vec::with_capacity(targets.len() * judges.len() * iterations);
        for target in targets {
            for judge in judges {
                for iteration in 1..=iterations {
                    jobs.push((target, judge.as_str(), iteration));
                }
            }
        }

        let mut evaluations: Vec<JudgeEvaluation> =
            stream::iter(jobs.into_iter().map(|(target, judge, iteration)| async move {
                if cancel
                    .map(|f| f.load(AtomicOrdering::Relaxed))
                    .unwrap_or(false)
                {
                    return None;
                }
                match self.judge_once(config, target, judge, iteration).await {
                    Ok(eval) => {
                        self.progress.publish(
                            ProgressEvent::new(config.run_id, ProgressKind::EvalRecorded, "evaluation")
                                .artifact(&eval.artifact_id)
                                .message(format!("{judge} iter {iteration}")),
                        );
                        Some(eval)
                    }
                    Err(err) => {
                        tracing::warn!(
                            artifact_id = %target.artifact_id,
                            judge,
                            iteration,
                            error = %err,
                            "Judge evaluation failed"
                        );
                        self.progress.publish(
                            ProgressEvent::new(config.run_id, ProgressKind::EvalFailed, "evaluation")
                                .artifact(&target.artifact_id)
                                .message(err),
                        );
                        None
                    }
                }
            }))
            .buffer_unordered(config.evaluation_concurrency)
            .filter_map(|e| async move { e })
            .collect()
            .await;

        // Deterministic output regardless of completion order. Targets arrive
        // in artifact creation order; keeping that order here is what lets
        // downstream ranking break exact-score ties in favour of the
        // earlier-created artifact.
        let position: HashMap<&str, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.artifact_id.as_str(), i))
            .collect();
        evaluations.sort_by(|a, b| {
            let pa = position.get(a.artifact_id.as_str()).copied().unwrap_or(usize::MAX);
            let pb = position.get(b.artifact_id.as_str()).copied().unwrap_or(usize::MAX);
            (pa, &a.judge_model, a.iteration).cmp(&(pb, &b.judge_model, b.iteration))
        });
        evaluations
    }

    async fn judge_once(
        &self,
        config: &RunConfig,
        target: &EvalTarget,
        judge: &str,
        iteration: usize,
    ) -> Result<JudgeEvaluation, String> {
        let criteria = &config.evaluation.criteria;
        let call_timeout = config.call_timeout();

        let (scores, cost) = call_with_retry(&self.retry, |_ctx| {
            let gateway = self.gateway.clone();
            let prompt = render_judge(&target.query, criteria, &target.content);
            let judge = judge.to_string();
            let run_id = config.run_id;
            async move {
                let request = ChatRequest::new(
                    ChatModel::openrouter(judge),
                    prompt.to_messages(),
                    Attribution::new("evaluator::judge").with_run(run_id),
                )
                .json();

                let response = match timeout(call_timeout, gateway.chat(request)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(ProviderError::Timeout(call_timeout, None)),
                };

                // A parse failure is indistinguishable from a structurally
                // unusable response; route it through the empty-response
                // retry path.
                let scores = parse_judge_response(&response.content, criteria)
                    .map_err(|e| ProviderError::empty_response(e.to_string()))?;
                Ok((scores, response.cost_nanodollars))
            }
        })
        .await
        .map_err(|e| e.to_string())?;

        let average = mean(scores.iter().map(|s| s.score)).unwrap_or(0.0);
        Ok(JudgeEvaluation {
            artifact_id: target.artifact_id.clone(),
            judge_model: judge.to_string(),
            iteration,
            scores,
            average,
            cost_nanodollars: cost,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Combine phase: synthesize ranked reports into one "gold standard" output.
//!
//! Four strategies with different cost/quality tradeoffs. The only strategy
//! that can fail at runtime is IntelligentMerge (it makes an LLM call); it
//! degrades to Concatenate and records that it did so, rather than failing
//! the phase. Configuration problems are surfaced immediately instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;

use crate::config::{CombineSettings, CombineStrategy, SectionPick};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::prompts::render_merge;
use crate::retry::{call_with_retry, RetryPolicyEngine};
use uuid::Uuid;

/// Error type for combine operations.
#[derive(Debug, thiserror::Error)]
pub enum CombineError {
    #[error("combine misconfigured: {0}")]
    Config(String),
    #[error("no reports to combine")]
    NoInput,
}

// =============================================================================
// TYPES
// =============================================================================

/// One ranked report feeding the combine, best first.
#[derive(Debug, Clone)]
pub struct RankedReport {
    pub artifact_id: String,
    pub model: String,
    pub content: String,
    /// Single-document summary score, when evaluation ran.
    pub score: Option<f64>,
}

/// Output of one combine invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CombineResult {
    pub document_id: String,
    pub content: String,
    /// Strategy the config asked for.
    pub requested_strategy: CombineStrategy,
    /// Strategy that actually produced the content. Differs from the
    /// requested one only on recorded fallback.
    pub strategy_used: CombineStrategy,
    /// Why the requested strategy was abandoned, when it was.
    pub fallback_reason: Option<String>,
    pub source_artifact_ids: Vec<String>,
    pub cost_nanodollars: i64,
}

// =============================================================================
// DETERMINISTIC STRATEGIES
// =============================================================================

/// Join reports with the configured separator, optionally prefixing each
/// with a provenance header.
fn concatenate(reports: &[RankedReport], settings: &CombineSettings) -> String {
    let blocks: Vec<String> = reports
        .iter()
        .enumerate()
        .map(|(i, r)| {
            if settings.include_headers {
                let score = r
                    .score
                    .map(|s| format!(", score {s:.2}"))
                    .unwrap_or_default();
                format!("## Report {} — {}{}\n\n{}", i + 1, r.model, score, r.content)
            } else {
                r.content.clone()
            }
        })
        .collect();
    blocks.join(&settings.separator)
}

/// Normalized section key: header text lowercased with markdown markers and
/// punctuation stripped, whitespace collapsed.
fn section_key(header: &str) -> String {
    header
        .trim_start_matches('#')
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A report split at its markdown headers. Text before the first header
/// becomes a preamble section with an empty key.
fn split_sections(content: &str) -> Vec<(String, String, String)> {
    let mut sections: Vec<(String, String, String)> = Vec::new();
    let mut current_header = String::new();
    let mut current_key = String::new();
    let mut body = String::new();

    for line in content.lines() {
        if line.starts_with('#') {
            if !body.trim().is_empty() || !current_header.is_empty() {
                sections.push((current_key.clone(), current_header.clone(), body.clone()));
            }
            current_header = line.to_string();
            current_key = section_key(line);
            body = String::new();
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    if !body.trim().is_empty() || !current_header.is_empty() {
        sections.push((current_key, current_header, body));
    }
    sections
}

/// Merge reports section-by-section. Sections are emitted in first-seen
/// order across reports; when several reports carry the same section, the
/// configured pick policy decides which body survives.
fn section_assembly(reports: &[RankedReport], settings: &CombineSettings) -> String {
    if reports.len() == 1 {
        // Nothing to assemble from a single report.
        return reports[0].content.clone();
    }

    let mut order: Vec<String> = Vec::new();
    // key -> (header, body)
    let mut picked: Vec<(String, String, String)> = Vec::new();

    for report in reports {
        for (key, header, body) in split_sections(&report.content) {
            if body.trim().len() < settings.min_section_chars {
                continue;
            }
            match picked.iter_mut().find(|(k, _, _)| *k == key) {
                None => {
                    order.push(key.clone());
                    picked.push((key, header, body));
                }
                Some((_, _, existing)) => {
                    if settings.section_pick == SectionPick::Longest
                        && body.trim().len() > existing.trim().len()
                    {
                        *existing = body;
                    }
                    // FirstSeen keeps what is already there.
                }
            }
        }
    }

    let mut out = String::new();
    for key in &order {
        if let Some((_, header, body)) = picked.iter().find(|(k, _, _)| k == key) {
            if !header.is_empty() {
                out.push_str(header);
                out.push('\n');
            }
            out.push_str(body.trim_end());
            out.push_str("\n\n");
        }
    }
    out.trim_end().to_string()
}

// =============================================================================
// COMBINER
// =============================================================================

/// Executes the combine phase for one document at a time.
pub struct Combiner {
    /// Present only when an LLM-backed strategy can run.
    gateway: Option<Arc<dyn ChatGateway>>,
    retry: RetryPolicyEngine,
    call_timeout: Duration,
}

impl Combiner {
    pub fn new(gateway: Option<Arc<dyn ChatGateway>>, retry: RetryPolicyEngine) -> Self {
        Self {
            gateway,
            retry,
            call_timeout: Duration::from_millis(crate::config::default_call_timeout_ms()),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Combine ranked reports for one document.
    ///
    /// `reports` must already be truncated to the configured top-N, best
    /// first.
    pub async fn combine(
        &self,
        run_id: Uuid,
        document_id: &str,
        query: &str,
        reports: &[RankedReport],
        settings: &CombineSettings,
    ) -> Result<CombineResult, CombineError> {
        if reports.is_empty() {
            return Err(CombineError::NoInput);
        }
        let source_artifact_ids: Vec<String> =
            reports.iter().map(|r| r.artifact_id.clone()).collect();

        let base = |content: String, used: CombineStrategy, fallback: Option<String>, cost: i64| {
            CombineResult {
                document_id: document_id.to_string(),
                content,
                requested_strategy: settings.strategy,
                strategy_used: used,
                fallback_reason: fallback,
                source_artifact_ids: source_artifact_ids.clone(),
                cost_nanodollars: cost,
            }
        };

        // A single report short-circuits to pass-through, whatever the
        // strategy: there is nothing to join, assemble or merge.
        if reports.len() == 1 {
            return Ok(base(reports[0].content.clone(), settings.strategy, None, 0));
        }

        match settings.strategy {
            CombineStrategy::Concatenate => Ok(base(
                concatenate(reports, settings),
                CombineStrategy::Concatenate,
                None,
                0,
            )),
            CombineStrategy::BestOfN => Ok(base(
                reports[0].content.clone(),
                CombineStrategy::BestOfN,
                None,
                0,
            )),
            CombineStrategy::SectionAssembly => Ok(base(
                section_assembly(reports, settings),
                CombineStrategy::SectionAssembly,
                None,
                0,
            )),
            CombineStrategy::IntelligentMerge => {
                // Misconfiguration fails the call; only provider failures
                // degrade.
                let gateway = self
                    .gateway
                    .clone()
                    .ok_or_else(|| CombineError::Config("intelligent_merge requires a gateway".into()))?;
                let model = settings
                    .model
                    .clone()
                    .ok_or_else(|| CombineError::Config("intelligent_merge requires a model".into()))?;
                let instruction = settings
                    .synthesis_instruction
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        CombineError::Config(
                            "intelligent_merge requires a synthesis instruction".into(),
                        )
                    })?;

                match self
                    .merge_call(gateway, run_id, &model, instruction, query, reports)
                    .await
                {
                    Ok((content, cost)) => Ok(base(
                        content,
                        CombineStrategy::IntelligentMerge,
                        None,
                        cost,
                    )),
                    Err(reason) => {
                        tracing::warn!(
                            document_id,
                            %reason,
                            "Intelligent merge failed, degrading to concatenation"
                        );
                        Ok(base(
                            concatenate(reports, settings),
                            CombineStrategy::Concatenate,
                            Some(reason),
                            0,
                        ))
                    }
                }
            }
        }
    }

    async fn merge_call(
        &self,
        gateway: Arc<dyn ChatGateway>,
        run_id: Uuid,
        model: &str,
        instruction: &str,
        query: &str,
        reports: &[RankedReport],
    ) -> Result<(String, i64), String> {
        let labelled: Vec<(String, String)> = reports
            .iter()
            .map(|r| (r.model.clone(), r.content.clone()))
            .collect();
        let call_timeout = self.call_timeout;

        call_with_retry(&self.retry, |_ctx| {
            let gateway = gateway.clone();
            let prompt = render_merge(instruction, query, &labelled);
            let model = model.to_string();
            async move {
                let request = ChatRequest::new(
                    ChatModel::openrouter(model),
                    prompt.to_messages(),
                    Attribution::new("combine::merge").with_run(run_id),
                );
                let response = match timeout(call_timeout, gateway.chat(request)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(ProviderError::Timeout(call_timeout, None)),
                };
                if response.content.trim().is_empty() {
                    return Err(ProviderError::empty_response("merge output was empty"));
                }
                Ok((response.content, response.cost_nanodollars))
            }
        })
        .await
        .map_err(|e| e.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

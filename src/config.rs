//! Run configuration.
//!
//! A [`RunConfig`] is the fully-resolved, immutable input to the
//! orchestrator. The core never reads raw user input, environment files, or
//! presets directly; the host application resolves all of that first.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Hard ceiling on any configured concurrency budget.
pub const MAX_CONCURRENCY: usize = 64;

/// Document to generate artifacts for.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentSpec {
    /// Stable identifier.
    pub id: String,
    /// The query/topic the generators answer.
    pub query: String,
    /// Optional supplementary context shown to the generator.
    #[serde(default)]
    pub context: Option<String>,
}

/// A generator kind: a named way of producing an artifact.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneratorSpec {
    /// Stable identifier, e.g. "deep-research" or "summary".
    pub id: String,
    /// Instructions folded into the generation prompt.
    pub instructions: String,
    /// Optional prompt template slug.
    #[serde(default)]
    pub prompt_template_slug: Option<String>,
}

/// Elo constants. Inherited defaults (1000 / 32) are conventional, not laws;
/// both are run-configurable.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct EloSettings {
    #[serde(default = "default_initial_rating")]
    pub initial_rating: f64,
    #[serde(default = "default_k_factor")]
    pub k_factor: f64,
}

impl Default for EloSettings {
    fn default() -> Self {
        Self {
            initial_rating: default_initial_rating(),
            k_factor: default_k_factor(),
        }
    }
}

fn default_initial_rating() -> f64 {
    1000.0
}

fn default_k_factor() -> f64 {
    32.0
}

/// Single-document judging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvalSettings {
    /// Whether the single-eval phase runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Judge models, e.g. "openai/gpt-5-mini". Non-empty when enabled.
    #[serde(default)]
    pub judge_models: Vec<String>,
    /// Iterations per (artifact, judge).
    #[serde(default = "default_one")]
    pub iterations: usize,
    /// Criteria each judge scores.
    #[serde(default = "default_criteria")]
    pub criteria: Vec<String>,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            judge_models: Vec::new(),
            iterations: 1,
            criteria: default_criteria(),
        }
    }
}

fn default_criteria() -> Vec<String> {
    ["accuracy", "completeness", "clarity", "grounding"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Pairwise tournament configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PairwiseSettings {
    /// Whether the pairwise phase runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Restrict candidates to the top-N by single-doc average.
    /// None means all artifacts compete.
    #[serde(default)]
    pub top_n: Option<usize>,
}

/// Synthesis strategy for the combine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    /// Join reports with separators. Deterministic, always succeeds.
    Concatenate,
    /// Return the single highest-scored report unchanged.
    BestOfN,
    /// Merge reports section-by-section on structural headers.
    SectionAssembly,
    /// Single LLM call embedding all reports. Falls back to Concatenate.
    IntelligentMerge,
}

/// Which candidate wins when several reports share a section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionPick {
    #[default]
    Longest,
    FirstSeen,
}

/// Combine ("gold standard" synthesis) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CombineSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: CombineStrategy,
    /// Model for IntelligentMerge.
    #[serde(default)]
    pub model: Option<String>,
    /// How many top reports feed the combine.
    #[serde(default = "default_combine_top_n")]
    pub top_n: usize,
    /// Caller-supplied synthesis instruction. Required for IntelligentMerge;
    /// there is no built-in default.
    #[serde(default)]
    pub synthesis_instruction: Option<String>,
    /// Per-report header (model, score) in Concatenate output.
    #[serde(default = "default_true")]
    pub include_headers: bool,
    /// Separator between concatenated reports.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Candidate policy for SectionAssembly.
    #[serde(default)]
    pub section_pick: SectionPick,
    /// Sections shorter than this are dropped as noise.
    #[serde(default = "default_min_section_chars")]
    pub min_section_chars: usize,
}

impl Default for CombineSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_strategy(),
            model: None,
            top_n: default_combine_top_n(),
            synthesis_instruction: None,
            include_headers: true,
            separator: default_separator(),
            section_pick: SectionPick::default(),
            min_section_chars: default_min_section_chars(),
        }
    }
}

fn default_strategy() -> CombineStrategy {
    CombineStrategy::Concatenate
}

fn default_combine_top_n() -> usize {
    3
}

fn default_separator() -> String {
    "\n\n---\n\n".to_string()
}

fn default_min_section_chars() -> usize {
    40
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_generation_concurrency() -> usize {
    4
}

fn default_evaluation_concurrency() -> usize {
    8
}

pub(crate) fn default_call_timeout_ms() -> u64 {
    180_000
}

fn default_wall_clock_ceiling_ms() -> u64 {
    2 * 60 * 60 * 1000
}

fn default_temperature() -> f32 {
    0.7
}

/// Fully-resolved run configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Run identifier, carried through attribution and progress events.
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,

    /// Documents to produce artifacts for.
    pub documents: Vec<DocumentSpec>,

    /// Generator kinds.
    pub generators: Vec<GeneratorSpec>,

    /// Generation models as "provider/model" ids (the prefix names the
    /// provider route, e.g. "anthropic/claude-3-5-haiku").
    pub models: Vec<String>,

    /// Generation iterations per (document, generator, model).
    #[serde(default = "default_one")]
    pub generation_iterations: usize,

    /// Sampling temperature for generation calls.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Single-document judging.
    #[serde(default)]
    pub evaluation: EvalSettings,

    /// Pairwise tournament.
    #[serde(default)]
    pub pairwise: PairwiseSettings,

    /// Gold-standard synthesis.
    #[serde(default)]
    pub combine: CombineSettings,

    /// Re-judge combined outputs with the single-eval judges.
    #[serde(default)]
    pub post_combine_eval: bool,

    /// Elo constants for the tournament.
    #[serde(default)]
    pub elo: EloSettings,

    /// Concurrency budget for generation tasks.
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,

    /// Concurrency budget for judge calls (single-eval and pairwise).
    #[serde(default = "default_evaluation_concurrency")]
    pub evaluation_concurrency: usize,

    /// Per-provider-call timeout in milliseconds. Overruns classify as
    /// transient-network failures, not a separate mechanism.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Safety ceiling for the whole run. Sub-phase timeouts are expected to
    /// fire first; this only bounds catastrophic hangs.
    #[serde(default = "default_wall_clock_ceiling_ms")]
    pub wall_clock_ceiling_ms: u64,
}

/// Configuration rejection.
#[derive(Debug, thiserror::Error)]
#[error("invalid run config: {0}")]
pub struct ConfigError(pub String);

impl RunConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn wall_clock_ceiling(&self) -> Duration {
        Duration::from_millis(self.wall_clock_ceiling_ms)
    }

    /// Total generation tasks this config expands to.
    pub fn task_count(&self) -> usize {
        self.documents.len()
            * self.generators.len()
            * self.models.len()
            * self.generation_iterations
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.documents.is_empty() {
            return Err(ConfigError("documents must not be empty".into()));
        }
        if self.generators.is_empty() {
            return Err(ConfigError("generators must not be empty".into()));
        }
        if self.models.is_empty() {
            return Err(ConfigError("models must not be empty".into()));
        }
        if self.generation_iterations == 0 {
            return Err(ConfigError("generation_iterations must be >= 1".into()));
        }

        let mut doc_ids: HashSet<&str> = HashSet::new();
        for d in &self.documents {
            if !doc_ids.insert(d.id.as_str()) {
                return Err(ConfigError(format!("duplicate document id: {}", d.id)));
            }
        }
        let mut gen_ids: HashSet<&str> = HashSet::new();
        for g in &self.generators {
            if !gen_ids.insert(g.id.as_str()) {
                return Err(ConfigError(format!("duplicate generator id: {}", g.id)));
            }
        }
        let mut model_ids: HashSet<&str> = HashSet::new();
        for m in &self.models {
            if !model_ids.insert(m.as_str()) {
                return Err(ConfigError(format!("duplicate model: {m}")));
            }
        }

        if self.evaluation.enabled {
            if self.evaluation.judge_models.is_empty() {
                return Err(ConfigError(
                    "evaluation enabled but judge_models is empty".into(),
                ));
            }
            if self.evaluation.iterations == 0 {
                return Err(ConfigError("evaluation.iterations must be >= 1".into()));
            }
            if self.evaluation.criteria.is_empty() {
                return Err(ConfigError("evaluation.criteria must not be empty".into()));
            }
        }

        if self.pairwise.enabled {
            if self.evaluation.judge_models.is_empty() {
                return Err(ConfigError(
                    "pairwise enabled but judge_models is empty".into(),
                ));
            }
            if matches!(self.pairwise.top_n, Some(0)) {
                return Err(ConfigError("pairwise.top_n must be >= 1".into()));
            }
        }

        if self.combine.enabled {
            if self.combine.top_n == 0 {
                return Err(ConfigError("combine.top_n must be >= 1".into()));
            }
            if self.combine.strategy == CombineStrategy::IntelligentMerge {
                if self.combine.model.is_none() {
                    return Err(ConfigError(
                        "intelligent_merge requires combine.model".into(),
                    ));
                }
                // No built-in synthesis text exists; the instruction must
                // come from configuration, or the run fails here rather than
                // degrading silently later.
                if self
                    .combine
                    .synthesis_instruction
                    .as_deref()
                    .map(str::trim)
                    .map_or(true, str::is_empty)
                {
                    return Err(ConfigError(
                        "intelligent_merge requires combine.synthesis_instruction".into(),
                    ));
                }
            }
        }

        if self.post_combine_eval && !self.combine.enabled {
            return Err(ConfigError(
                "post_combine_eval requires combine.enabled".into(),
            ));
        }

        for (name, value) in [
            ("generation_concurrency", self.generation_concurrency),
            ("evaluation_concurrency", self.evaluation_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError(format!("{name} must be >= 1")));
            }
            if value > MAX_CONCURRENCY {
                return Err(ConfigError(format!("{name} must be <= {MAX_CONCURRENCY}")));
            }
        }

        if self.call_timeout_ms == 0 {
            return Err(ConfigError("call_timeout_ms must be >= 1".into()));
        }

        if !self.elo.k_factor.is_finite() || self.elo.k_factor <= 0.0 {
            return Err(ConfigError("elo.k_factor must be finite and > 0".into()));
        }
        if !self.elo.initial_rating.is_finite() {
            return Err(ConfigError("elo.initial_rating must be finite".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal valid config for unit tests.
    pub fn base_config() -> RunConfig {
        RunConfig {
            run_id: Uuid::new_v4(),
            documents: vec![DocumentSpec {
                id: "doc-1".into(),
                query: "What changed in the market this week?".into(),
                context: None,
            }],
            generators: vec![GeneratorSpec {
                id: "report".into(),
                instructions: "Write a grounded report with citations.".into(),
                prompt_template_slug: None,
            }],
            models: vec!["openai/gpt-5-mini".into()],
            generation_iterations: 1,
            temperature: 0.7,
            evaluation: EvalSettings {
                enabled: true,
                judge_models: vec!["anthropic/claude-3-5-haiku".into()],
                iterations: 1,
                criteria: default_criteria(),
            },
            pairwise: PairwiseSettings::default(),
            combine: CombineSettings::default(),
            post_combine_eval: false,
            elo: EloSettings::default(),
            generation_concurrency: 2,
            evaluation_concurrency: 2,
            call_timeout_ms: 5_000,
            wall_clock_ceiling_ms: 60_000,
        }
    }
}

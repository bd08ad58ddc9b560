//! Generation task expansion and bounded-concurrency scheduling.
//!
//! A run's generation work is the cartesian product of documents, generators,
//! models and iterations, expanded up front in deterministic order. The
//! scheduler executes tasks through `buffer_unordered` with the configured
//! concurrency budget, one retry loop per task via the policy engine, and a
//! cooperative cancel flag checked before each dispatch.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::timeout;

use crate::config::{DocumentSpec, GeneratorSpec, RunConfig};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::progress::{now_epoch_ms, ProgressEvent, ProgressKind, ProgressSink};
use crate::prompts::{
    generation_prompt_by_slug, render_generation, DEFAULT_GENERATION_PROMPT, GROUNDING_ENRICHMENT,
    RATIONALE_ENRICHMENT,
};
use crate::retry::{call_with_retry, RetryPolicyEngine};

// =============================================================================
// TASKS
// =============================================================================

/// Terminal and in-flight task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One unit of generation work.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationTask {
    /// Content-derived identity key, stable across re-runs of the same
    /// (document, generator, model, iteration) coordinate.
    pub id: String,
    /// Expansion ordinal, used to restore deterministic ordering after
    /// unordered completion.
    pub ordinal: usize,
    pub document_id: String,
    pub generator_id: String,
    pub model: String,
    /// 1-based iteration index.
    pub iteration: usize,
    pub status: TaskStatus,
    /// Generated artifact text. Present only when Completed.
    pub content: Option<String>,
    /// Provider-reported reasoning trace, when the model emitted one.
    pub reasoning: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    /// Provider attempts made, including retries.
    pub attempts: u32,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub duration_ms: Option<u64>,
    /// Terminal error description. Present only when Failed.
    pub error: Option<String>,
}

/// Identity key for a task coordinate.
fn task_key(document_id: &str, generator_id: &str, model: &str, iteration: usize) -> String {
    let composite = format!("{document_id}::{generator_id}::{model}::{iteration}");
    blake3::hash(composite.as_bytes()).to_hex()[..16].to_string()
}

/// Expand a run config into its full task list.
///
/// Order is deterministic: documents, then generators, then models, then
/// iterations, each in config order.
pub fn expand_tasks(config: &RunConfig) -> Vec<GenerationTask> {
    let mut tasks = Vec::with_capacity(config.task_count());
    let mut ordinal = 0;
    for doc in &config.documents {
        for gen in &config.generators {
            for model in &config.models {
                for iteration in 1..=config.generation_iterations {
                    tasks.push(GenerationTask {
                        id: task_key(&doc.id, &gen.id, model, iteration),
                        ordinal,
                        document_id: doc.id.clone(),
                        generator_id: gen.id.clone(),
                        model: model.clone(),
                        iteration,
                        status: TaskStatus::Pending,
                        content: None,
                        reasoning: None,
                        input_tokens: 0,
                        output_tokens: 0,
                        cost_nanodollars: 0,
                        attempts: 0,
                        started_at_ms: None,
                        finished_at_ms: None,
                        duration_ms: None,
                        error: None,
                    });
                    ordinal += 1;
                }
            }
        }
    }
    tasks
}

// =============================================================================
// ARTIFACTS
// =============================================================================

/// A completed generation output, as consumed by evaluation, the tournament
/// and the combine phase.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Same identity key as the task that produced it.
    pub id: String,
    pub document_id: String,
    pub generator_id: String,
    pub model: String,
    pub iteration: usize,
    pub content: String,
}

/// Collect completed tasks into artifacts, preserving task order.
pub fn artifacts(tasks: &[GenerationTask]) -> Vec<Artifact> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| {
            t.content.as_ref().map(|content| Artifact {
                id: t.id.clone(),
                document_id: t.document_id.clone(),
                generator_id: t.generator_id.clone(),
                model: t.model.clone(),
                iteration: t.iteration,
                content: content.clone(),
            })
        })
        .collect()
}

// =============================================================================
// ARTIFACT VALIDATION
// =============================================================================

const ENRICH_NONE: u8 = 0;
const ENRICH_GROUNDING: u8 = 1;
const ENRICH_RATIONALE: u8 = 2;

/// Check the generated artifact for required structure.
///
/// Failures are expressed as provider errors whose messages carry the
/// keywords the retry engine classifies on, so a validation miss flows
/// through the same retry path as any provider failure.
fn validate_artifact(content: &str, reasoning: Option<&str>) -> Result<(), (ProviderError, u8)> {
    let lower = content.to_lowercase();

    let grounded = lower.contains("http")
        || lower.contains("source:")
        || lower.contains("sources:")
        || lower.contains("[source")
        || content.contains("](");
    if !grounded {
        return Err((
            ProviderError::provider("validator", "response missing grounding citations"),
            ENRICH_GROUNDING,
        ));
    }

    let has_rationale = reasoning.map(|r| !r.trim().is_empty()).unwrap_or(false)
        || lower.contains("rationale");
    if !has_rationale {
        return Err((
            ProviderError::provider("validator", "response missing rationale"),
            ENRICH_RATIONALE,
        ));
    }

    Ok(())
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Executes generation tasks with bounded concurrency.
pub struct TaskScheduler {
    gateway: Arc<dyn ChatGateway>,
    retry: RetryPolicyEngine,
    progress: Arc<dyn ProgressSink>,
}

impl TaskScheduler {
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

    /// Execute all tasks, returning them in expansion order with terminal
    /// statuses. Individual failures never abort the batch.
    ///
    /// The cancel flag is cooperative: tasks not yet dispatched when it flips
    /// are marked Cancelled; in-flight tasks run to completion.
    pub async fn execute(
        &self,
        config: &RunConfig,
        tasks: Vec<GenerationTask>,
        cancel: Option<&AtomicBool>,
    ) -> Vec<GenerationTask> {
        let total = tasks.len().max(1);
        let done = Arc::new(AtomicUsize::new(0));

        let mut results: Vec<GenerationTask> = stream::iter(tasks.into_iter().map(|task| {
            let done = done.clone();
            async move {
                if cancel
                    .map(|f| f.load(AtomicOrdering::Relaxed))
                    .unwrap_or(false)
                {
                    let mut task = task;
                    task.status = TaskStatus::Cancelled;
                    return task;
                }
                let task = self.run_one(config, task).await;
                let finished = done.fetch_add(1, AtomicOrdering::Relaxed) + 1;
                let (kind, msg) = match task.status {
                    TaskStatus::Completed => (ProgressKind::TaskCompleted, String::new()),
                    _ => (
                        ProgressKind::TaskFailed,
                        task.error.clone().unwrap_or_default(),
                    ),
                };
                self.progress.publish(
                    ProgressEvent::new(config.run_id, kind, "generation")
                        .artifact(&task.id)
                        .fraction(finished as f64 / total as f64)
                        .message(msg),
                );
                task
            }
        }))
        .buffer_unordered(config.generation_concurrency)
        .collect()
        .await;

        results.sort_by_key(|t| t.ordinal);
        results
    }

    async fn run_one(&self, config: &RunConfig, mut task: GenerationTask) -> GenerationTask {
        let Some(doc) = config.documents.iter().find(|d| d.id == task.document_id) else {
            task.status = TaskStatus::Failed;
            task.error = Some(format!("unknown document id: {}", task.document_id));
            return task;
        };
        let Some(generator) = config.generators.iter().find(|g| g.id == task.generator_id) else {
            task.status = TaskStatus::Failed;
            task.error = Some(format!("unknown generator id: {}", task.generator_id));
            return task;
        };

        task.status = TaskStatus::Running;
        task.started_at_ms = Some(now_epoch_ms());
        let started = Instant::now();
        self.progress.publish(
            ProgressEvent::new(config.run_id, ProgressKind::TaskStarted, "generation")
                .artifact(&task.id),
        );

        let outcome = self.generate(config, doc, generator, &task).await;

        task.finished_at_ms = Some(now_epoch_ms());
        task.duration_ms = Some(started.elapsed().as_millis() as u64);

        match outcome {
            Ok((response, attempts)) => {
                task.status = TaskStatus::Completed;
                task.content = Some(response.content);
                task.reasoning = response.reasoning;
                task.input_tokens = response.input_tokens;
                task.output_tokens = response.output_tokens;
                task.cost_nanodollars = response.cost_nanodollars;
                task.attempts = attempts;
            }
            Err((err, attempts)) => {
                tracing::warn!(task_id = %task.id, model = %task.model, error = %err, "Generation task failed");
                task.status = TaskStatus::Failed;
                task.error = Some(err);
                task.attempts = attempts;
            }
        }
        task
    }

    async fn generate(
        &self,
        config: &RunConfig,
        doc: &DocumentSpec,
        generator: &GeneratorSpec,
        task: &GenerationTask,
    ) -> Result<(crate::gateway::ChatResponse, u32), (String, u32)> {
        let template = generator
            .prompt_template_slug
            .as_deref()
            .and_then(generation_prompt_by_slug)
            .unwrap_or(DEFAULT_GENERATION_PROMPT);

        let call_timeout = config.call_timeout();
        // Which enrichment suffix the next enhanced attempt should carry,
        // set by the most recent validation failure.
        let enrichment = Arc::new(AtomicU8::new(ENRICH_NONE));
        let attempts = Arc::new(AtomicUsize::new(0));

        let result = call_with_retry(&self.retry, |ctx| {
            let gateway = self.gateway.clone();
            let enrichment = enrichment.clone();
            let attempts = attempts.clone();
            let model = task.model.clone();
            let run_id = config.run_id;
            let temperature = config.temperature;
            let query = doc.query.clone();
            let context = doc.context.clone();
            let instructions = generator.instructions.clone();
            async move {
                attempts.fetch_add(1, AtomicOrdering::Relaxed);

                let suffix = if ctx.enhance_prompt {
                    match enrichment.load(AtomicOrdering::Relaxed) {
                        ENRICH_GROUNDING => Some(GROUNDING_ENRICHMENT),
                        ENRICH_RATIONALE => Some(RATIONALE_ENRICHMENT),
                        _ => None,
                    }
                } else {
                    None
                };
                let prompt = render_generation(
                    template,
                    &query,
                    context.as_deref(),
                    &instructions,
                    suffix,
                );

                let request = ChatRequest::new(
                    ChatModel::openrouter(model),
                    prompt.to_messages(),
                    Attribution::new("scheduler::generate").with_run(run_id),
                )
                .temperature(temperature);

                let response = match timeout(call_timeout, gateway.chat(request)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(ProviderError::Timeout(call_timeout, None)),
                };

                if let Err((err, which)) =
                    validate_artifact(&response.content, response.reasoning.as_deref())
                {
                    enrichment.store(which, AtomicOrdering::Relaxed);
                    return Err(err);
                }
                Ok(response)
            }
        })
        .await;

        let made = attempts.load(AtomicOrdering::Relaxed) as u32;
        match result {
            Ok(response) => Ok((response, made)),
            Err(exhausted) => Err((exhausted.to_string(), made)),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

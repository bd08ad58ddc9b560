#![forbid(unsafe_code)]

//! # crucible-harness
//!
//! Batch LLM generation with built-in quality control.
//!
//! A run expands documents x generators x models x iterations into generation
//! tasks, executes them with bounded concurrency through a provider gateway,
//! then puts the outputs through judge evaluation, an Elo pairwise tournament,
//! and a combine phase that synthesizes the best reports into one output.
//! Every provider call goes through one retry policy engine that classifies
//! failures by keyword and backs off per category.

pub mod combine;
pub mod config;
pub mod eval;
pub mod gateway;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod task;
pub mod tournament;

pub use combine::{CombineError, CombineResult, Combiner, RankedReport};
pub use config::{
    CombineSettings, CombineStrategy, ConfigError, DocumentSpec, EloSettings, EvalSettings,
    GeneratorSpec, PairwiseSettings, RunConfig, SectionPick,
};
pub use eval::{DocumentEvalSummary, EvalTarget, Evaluator, JudgeEvaluation};
pub use gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChatResponse, ProviderError, ProviderGateway,
    UsageSink,
};
pub use orchestrator::{
    CancelHandle, JsonlPersistenceSink, NoopPersistenceSink, Orchestrator, PersistenceSink,
    RunResult, RunStatus,
};
pub use progress::{
    JsonlProgressSink, NoopProgressSink, ProgressEvent, ProgressKind, ProgressSink,
    TracingProgressSink,
};
pub use retry::{ErrorCategory, RetryDecision, RetryPolicyEngine};
pub use task::{Artifact, GenerationTask, TaskScheduler, TaskStatus};
pub use tournament::{PairwiseComparison, Rating, Tournament, TournamentResult};

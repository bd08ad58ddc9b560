//! Retry policy engine: error classification and backoff decisions.
//!
//! Classification is priority-ordered keyword matching over the error
//! message plus any captured diagnostic text. Validation signals outrank
//! rate-limit signals, which outrank network/timeout signals, which outrank
//! HTTP 5xx server errors, which outrank permanent auth/bad-request
//! categories. Anything unmatched is `Unknown` and gets one conservative
//! retry.
//!
//! The engine is the only place retry decisions are made. The gateway
//! performs single calls, and schedulers never back off on their own, so a
//! failed call is never delayed twice.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::gateway::ProviderError;

/// Classified failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Artifact lacks required grounding/citations. Retried with an
    /// enriched prompt that requests sources explicitly.
    MissingGrounding,
    /// Artifact lacks a reasoning trace. Retried with an enriched prompt.
    MissingRationale,
    /// Provider rate limit (HTTP 429 or equivalent).
    RateLimited,
    /// Network-level failure or timeout.
    Network,
    /// Provider-side 5xx (502/503/504) or overload.
    ServerError,
    /// Response arrived but was empty or structurally unusable. Treated as
    /// transient rather than a parse failure so it is retried.
    EmptyResponse,
    /// Authentication failure. Never retried.
    AuthFailure,
    /// Malformed request. Never retried.
    BadRequest,
    /// Unknown model/endpoint. Never retried.
    NotFound,
    /// Access denied or content refused. Never retried.
    Forbidden,
    /// Account quota exhausted. Never retried, even though providers often
    /// deliver it with a 429.
    QuotaExhausted,
    /// Unclassified. One conservative retry, then surfaced.
    Unknown,
}

impl ErrorCategory {
    /// Whether this category can never succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure
                | Self::BadRequest
                | Self::NotFound
                | Self::Forbidden
                | Self::QuotaExhausted
        )
    }

    /// Whether this is a validation category (prompt enrichment applies).
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingGrounding | Self::MissingRationale)
    }
}

/// Fixed retry policy for one category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryPolicy {
    /// Maximum retries after the first attempt. 0 means never retried.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap applied after the multiplier.
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier.
    pub multiplier: f64,
    /// Apply ±25% uniform jitter to the delay.
    pub jitter: bool,
    /// Retry should also enrich the prompt (validation categories only).
    pub enhance_prompt: bool,
}

impl CategoryPolicy {
    const fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            multiplier,
            jitter: true,
            enhance_prompt: false,
        }
    }

    const fn validation(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
            jitter: false,
            enhance_prompt: true,
        }
    }

    const fn permanent() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
            enhance_prompt: false,
        }
    }
}

/// Decision for one (category, attempt) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    /// Whether the call should be attempted again.
    pub retry: bool,
    /// Delay to impose before the retry.
    pub delay_ms: u64,
    /// Whether the retry prompt should request the missing element.
    pub enhance_prompt: bool,
}

/// Jitter amplitude: delays are perturbed by ±25%.
const JITTER_FRACTION: f64 = 0.25;

/// Classifies failures and produces bounded retry decisions.
#[derive(Debug, Clone)]
pub struct RetryPolicyEngine {
    missing_grounding: CategoryPolicy,
    missing_rationale: CategoryPolicy,
    rate_limited: CategoryPolicy,
    network: CategoryPolicy,
    server_error: CategoryPolicy,
    empty_response: CategoryPolicy,
    unknown: CategoryPolicy,
}

impl Default for RetryPolicyEngine {
    fn default() -> Self {
        Self {
            missing_grounding: CategoryPolicy::validation(2, 1_000, 8_000),
            missing_rationale: CategoryPolicy::validation(2, 1_000, 8_000),
            rate_limited: CategoryPolicy::new(4, 2_000, 60_000, 2.0),
            network: CategoryPolicy::new(3, 500, 15_000, 2.0),
            server_error: CategoryPolicy::new(3, 1_000, 30_000, 2.0),
            empty_response: CategoryPolicy::new(2, 500, 8_000, 2.0),
            unknown: CategoryPolicy::new(1, 1_000, 1_000, 1.0),
        }
    }
}

impl RetryPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the policy for one category.
    pub fn with_policy(mut self, category: ErrorCategory, policy: CategoryPolicy) -> Self {
        match category {
            ErrorCategory::MissingGrounding => self.missing_grounding = policy,
            ErrorCategory::MissingRationale => self.missing_rationale = policy,
            ErrorCategory::RateLimited => self.rate_limited = policy,
            ErrorCategory::Network => self.network = policy,
            ErrorCategory::ServerError => self.server_error = policy,
            ErrorCategory::EmptyResponse => self.empty_response = policy,
            ErrorCategory::Unknown => self.unknown = policy,
            // Permanent categories stay permanent.
            _ => {}
        }
        self
    }

    /// Policy table lookup.
    pub fn policy(&self, category: ErrorCategory) -> CategoryPolicy {
        match category {
            ErrorCategory::MissingGrounding => self.missing_grounding,
            ErrorCategory::MissingRationale => self.missing_rationale,
            ErrorCategory::RateLimited => self.rate_limited,
            ErrorCategory::Network => self.network,
            ErrorCategory::ServerError => self.server_error,
            ErrorCategory::EmptyResponse => self.empty_response,
            ErrorCategory::Unknown => self.unknown,
            _ => CategoryPolicy::permanent(),
        }
    }

    /// Classify a provider failure into a category.
    ///
    /// `diagnostic` is optional captured text beyond the error message
    /// itself (error body, subprocess stderr).
    pub fn classify(&self, error: &ProviderError, diagnostic: Option<&str>) -> ErrorCategory {
        let mut haystack = error.to_string().to_lowercase();
        if let Some(d) = error.diagnostic() {
            haystack.push('\n');
            haystack.push_str(&d.to_lowercase());
        }
        if let Some(d) = diagnostic {
            haystack.push('\n');
            haystack.push_str(&d.to_lowercase());
        }
        let status = error.http_status();

        // Validation signals outrank everything else.
        if contains_any(
            &haystack,
            &[
                "missing grounding",
                "no grounding",
                "without grounding",
                "missing citation",
                "no citations",
                "missing source",
            ],
        ) {
            return ErrorCategory::MissingGrounding;
        }
        if contains_any(
            &haystack,
            &[
                "missing rationale",
                "no rationale",
                "missing reasoning",
                "no reasoning trace",
            ],
        ) {
            return ErrorCategory::MissingRationale;
        }

        // Quota exhaustion often arrives as a 429; it must be matched before
        // the generic rate-limit keywords so it stays permanent.
        if contains_any(
            &haystack,
            &["insufficient_quota", "insufficient quota", "quota exceeded", "quota_exceeded"],
        ) {
            return ErrorCategory::QuotaExhausted;
        }

        if matches!(error, ProviderError::RateLimited { .. })
            || status == Some(429)
            || contains_any(&haystack, &["rate limit", "rate_limit", "too many requests"])
        {
            return ErrorCategory::RateLimited;
        }

        if matches!(error, ProviderError::EmptyResponse { .. }) {
            return ErrorCategory::EmptyResponse;
        }

        let network_shaped = match error {
            ProviderError::Timeout(_, _) => true,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        };
        if network_shaped
            || contains_any(
                &haystack,
                &[
                    "timed out",
                    "timeout",
                    "connection reset",
                    "connection refused",
                    "network error",
                    "dns",
                ],
            )
        {
            return ErrorCategory::Network;
        }

        if matches!(status, Some(502) | Some(503) | Some(504))
            || contains_any(
                &haystack,
                &[
                    "bad gateway",
                    "service unavailable",
                    "gateway timeout",
                    "internal server error",
                    "overloaded",
                    "502",
                    "503",
                    "504",
                ],
            )
        {
            return ErrorCategory::ServerError;
        }

        if status == Some(401)
            || contains_any(
                &haystack,
                &["unauthorized", "invalid api key", "authentication failed", "api key not"],
            )
        {
            return ErrorCategory::AuthFailure;
        }
        if status == Some(403)
            || matches!(error, ProviderError::Refused { .. })
            || contains_any(&haystack, &["forbidden", "permission denied", "refused"])
        {
            return ErrorCategory::Forbidden;
        }
        if status == Some(404) || contains_any(&haystack, &["not found", "model_not_found"]) {
            return ErrorCategory::NotFound;
        }
        if status == Some(400)
            || matches!(
                error,
                ProviderError::InvalidRequest { .. } | ProviderError::Config(_)
            )
            || contains_any(&haystack, &["invalid request", "bad request", "invalid_request"])
        {
            return ErrorCategory::BadRequest;
        }

        ErrorCategory::Unknown
    }

    /// Return the retry decision for a category at a given attempt number.
    ///
    /// `attempt` is 1-based: attempt 1 is the first retry decision, made
    /// after the first failure.
    pub fn decide(&self, category: ErrorCategory, attempt: u32) -> RetryDecision {
        let policy = self.policy(category);
        let retry = attempt <= policy.max_retries;
        RetryDecision {
            retry,
            delay_ms: if retry { backoff_delay_ms(&policy, attempt) } else { 0 },
            enhance_prompt: retry && policy.enhance_prompt,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Expected (jitter-free) backoff delay: base * multiplier^(attempt-1),
/// capped at the category maximum.
pub fn expected_delay_ms(policy: &CategoryPolicy, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = policy.base_delay_ms as f64 * policy.multiplier.powi(exp as i32);
    (raw.max(0.0) as u64).min(policy.max_delay_ms)
}

/// Backoff delay with the policy's jitter applied.
fn backoff_delay_ms(policy: &CategoryPolicy, attempt: u32) -> u64 {
    let expected = expected_delay_ms(policy, attempt) as f64;
    let perturbed = if policy.jitter {
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        expected * factor
    } else {
        expected
    };
    (perturbed.max(0.0) as u64).min(policy.max_delay_ms)
}

// =============================================================================
// Retry driver
// =============================================================================

/// Per-attempt context handed to the operation closure.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Whether the prompt should be enriched for this attempt
    /// (set after a validation-category failure).
    pub enhance_prompt: bool,
}

/// All retries for one call were exhausted (or the category was permanent).
#[derive(Debug, thiserror::Error)]
#[error("{source} (category {category:?} after {attempts} attempt(s))")]
pub struct RetryExhausted {
    pub category: ErrorCategory,
    pub attempts: u32,
    #[source]
    pub source: ProviderError,
}

/// Drive an operation through the retry policy.
///
/// The closure is invoked with a fresh [`RetryContext`] per attempt; the
/// driver owns classification, the decision, and the backoff sleep. Used by
/// the scheduler, evaluator, tournament and combine so none of them carries
/// its own retry loop.
pub async fn call_with_retry<T, F, Fut>(
    engine: &RetryPolicyEngine,
    mut op: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 1;
    let mut enhance_prompt = false;

    loop {
        let ctx = RetryContext {
            attempt,
            enhance_prompt,
        };
        match op(ctx).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let category = engine.classify(&err, None);
                let decision = engine.decide(category, attempt);
                if !decision.retry {
                    return Err(RetryExhausted {
                        category,
                        attempts: attempt,
                        source: err,
                    });
                }
                tracing::debug!(
                    category = ?category,
                    attempt,
                    delay_ms = decision.delay_ms,
                    error = %err,
                    "Retrying provider call"
                );
                enhance_prompt = enhance_prompt || decision.enhance_prompt;
                sleep(Duration::from_millis(decision.delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ErrorContext;
    use std::time::Duration;

    fn engine() -> RetryPolicyEngine {
        RetryPolicyEngine::default()
    }

    #[test]
    fn quota_outranks_rate_limit() {
        let err = ProviderError::rate_limited(
            Duration::from_secs(60),
            ErrorContext::new()
                .with_status(429)
                .with_diagnostic("insufficient_quota: please check billing"),
        );
        let category = engine().classify(&err, None);
        assert_eq!(category, ErrorCategory::QuotaExhausted);
        assert!(category.is_permanent());
        assert!(!engine().decide(category, 1).retry);
    }

    #[test]
    fn validation_outranks_rate_limit() {
        let err = ProviderError::provider(
            "validator",
            "response missing grounding citations; rate limit noted",
        );
        assert_eq!(engine().classify(&err, None), ErrorCategory::MissingGrounding);
    }

    #[test]
    fn diagnostic_text_participates_in_classification() {
        let err = ProviderError::provider("openrouter", "call failed");
        let category = engine().classify(&err, Some("stderr: missing rationale in output"));
        assert_eq!(category, ErrorCategory::MissingRationale);
    }

    #[test]
    fn rate_limit_outranks_timeout_keywords() {
        let err = ProviderError::provider("openrouter", "too many requests, timed out waiting");
        assert_eq!(engine().classify(&err, None), ErrorCategory::RateLimited);
    }

    #[test]
    fn bad_gateway_is_server_error() {
        let err = ProviderError::provider_with_context(
            "openrouter",
            "HTTP 502",
            ErrorContext::new().with_status(502),
        );
        assert_eq!(engine().classify(&err, None), ErrorCategory::ServerError);
    }

    #[test]
    fn auth_is_permanent() {
        let err = ProviderError::provider_with_context(
            "openrouter",
            "invalid api key",
            ErrorContext::new().with_status(401),
        );
        let category = engine().classify(&err, None);
        assert_eq!(category, ErrorCategory::AuthFailure);
        assert!(!engine().decide(category, 1).retry);
    }

    #[test]
    fn timeout_variant_is_network() {
        let err = ProviderError::Timeout(Duration::from_secs(30), None);
        assert_eq!(engine().classify(&err, None), ErrorCategory::Network);
    }

    #[test]
    fn empty_response_is_transient() {
        let err = ProviderError::empty_response("no choices");
        let category = engine().classify(&err, None);
        assert_eq!(category, ErrorCategory::EmptyResponse);
        assert!(engine().decide(category, 1).retry);
    }

    #[test]
    fn unknown_gets_one_retry() {
        let err = ProviderError::provider("openrouter", "weird flakiness");
        let category = engine().classify(&err, None);
        assert_eq!(category, ErrorCategory::Unknown);
        assert!(engine().decide(category, 1).retry);
        assert!(!engine().decide(category, 2).retry);
    }

    #[test]
    fn decide_cuts_off_past_max_retries() {
        let e = engine();
        for category in [
            ErrorCategory::MissingGrounding,
            ErrorCategory::MissingRationale,
            ErrorCategory::RateLimited,
            ErrorCategory::Network,
            ErrorCategory::ServerError,
            ErrorCategory::EmptyResponse,
            ErrorCategory::Unknown,
        ] {
            let max = e.policy(category).max_retries;
            assert!(e.decide(category, max).retry, "{category:?} at max");
            assert!(!e.decide(category, max + 1).retry, "{category:?} past max");
        }
    }

    #[test]
    fn permanent_categories_never_retry_attempt_one() {
        let e = engine();
        for category in [
            ErrorCategory::AuthFailure,
            ErrorCategory::BadRequest,
            ErrorCategory::NotFound,
            ErrorCategory::Forbidden,
            ErrorCategory::QuotaExhausted,
        ] {
            let d = e.decide(category, 1);
            assert!(!d.retry, "{category:?} must not retry");
            assert_eq!(d.delay_ms, 0);
        }
    }

    #[test]
    fn validation_retries_enhance_prompt() {
        let d = engine().decide(ErrorCategory::MissingGrounding, 1);
        assert!(d.retry);
        assert!(d.enhance_prompt);

        let d = engine().decide(ErrorCategory::Network, 1);
        assert!(!d.enhance_prompt);
    }

    #[test]
    fn expected_backoff_monotone_and_capped() {
        let policy = engine().policy(ErrorCategory::RateLimited);
        let mut prev = 0;
        for attempt in 1..=10 {
            let d = expected_delay_ms(&policy, attempt);
            assert!(d >= prev, "delay must be non-decreasing");
            assert!(d <= policy.max_delay_ms, "delay must respect the cap");
            prev = d;
        }
        // Base case: first retry waits exactly the base delay.
        assert_eq!(expected_delay_ms(&policy, 1), policy.base_delay_ms);
    }

    #[test]
    fn jittered_backoff_stays_within_band() {
        let policy = engine().policy(ErrorCategory::Network);
        let expected = expected_delay_ms(&policy, 2) as f64;
        for _ in 0..100 {
            let d = backoff_delay_ms(&policy, 2) as f64;
            assert!(d >= expected * (1.0 - JITTER_FRACTION) - 1.0);
            assert!(d <= (expected * (1.0 + JITTER_FRACTION)).min(policy.max_delay_ms as f64) + 1.0);
        }
    }

    #[tokio::test]
    async fn driver_passes_enhanced_prompt_after_validation_failure() {
        let engine = RetryPolicyEngine::default().with_policy(
            ErrorCategory::MissingGrounding,
            CategoryPolicy {
                max_retries: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
                multiplier: 1.0,
                jitter: false,
                enhance_prompt: true,
            },
        );

        let mut saw_enhanced = false;
        let result = call_with_retry(&engine, |ctx| {
            if ctx.enhance_prompt {
                saw_enhanced = true;
            }
            let attempt = ctx.attempt;
            async move {
                if attempt == 1 {
                    Err(ProviderError::provider(
                        "validator",
                        "response missing grounding citations",
                    ))
                } else {
                    Ok("grounded")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "grounded");
        assert!(saw_enhanced, "second attempt must carry enhance_prompt");
    }

    #[tokio::test]
    async fn driver_surfaces_permanent_immediately() {
        let engine = RetryPolicyEngine::default();
        let mut calls = 0u32;
        let result: Result<(), _> = call_with_retry(&engine, |_ctx| {
            calls += 1;
            async {
                Err(ProviderError::provider(
                    "openrouter",
                    "insufficient_quota: upgrade your plan",
                ))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.category, ErrorCategory::QuotaExhausted);
        assert_eq!(err.attempts, 1);
    }
}

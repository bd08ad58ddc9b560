//! Prompt templates for generation, judging, and synthesis.
//!
//! Domain logic for rendering prompts. Provider-agnostic.

use crate::gateway::Message;

// =============================================================================
// Rendering
// =============================================================================

/// Rendered prompt ready for an LLM call.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute `{name}` placeholders with escaped values.
    fn fill(&self, pairs: &[(&str, &str)]) -> PromptInstance {
        let mut system = self.system.to_string();
        let mut user = self.user.to_string();
        for (name, value) in pairs {
            let needle = format!("{{{name}}}");
            let safe = escape_xml_chars(value);
            system = system.replace(&needle, &safe);
            user = user.replace(&needle, &safe);
        }
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

// =============================================================================
// Generation
// =============================================================================

pub const GENERATION_V1: PromptTemplate = PromptTemplate {
    slug: "generation_v1",
    system: r#"You are a careful research writer. You produce complete, well-structured documents with markdown section headers. Every factual claim must be grounded: cite the sources you consulted inline. Before the document, think through your approach; include a brief rationale for the structure you chose."#,
    user: r#"<query>
{query}
</query>

<context>
{context}
</context>

<instructions>
{instructions}
</instructions>

Write the document now."#,
};

pub const GENERATION_TEMPLATES: &[PromptTemplate] = &[GENERATION_V1];
pub const DEFAULT_GENERATION_PROMPT: PromptTemplate = GENERATION_V1;

pub fn generation_prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    GENERATION_TEMPLATES.iter().find(|t| t.slug == slug).copied()
}

/// Appended to the user prompt when a validation retry asks for grounding.
pub const GROUNDING_ENRICHMENT: &str = "\n\nIMPORTANT: your previous attempt lacked grounding. \
Consult sources and cite every claim explicitly (inline citations with source names or URLs).";

/// Appended to the user prompt when a validation retry asks for a rationale.
pub const RATIONALE_ENRICHMENT: &str = "\n\nIMPORTANT: your previous attempt lacked a rationale. \
Begin with a short 'Rationale' paragraph explaining how you approached the task.";

/// Render a generation prompt, optionally carrying an enrichment suffix from
/// a validation retry.
pub fn render_generation(
    template: PromptTemplate,
    query: &str,
    context: Option<&str>,
    instructions: &str,
    enrichment: Option<&str>,
) -> PromptInstance {
    let mut instance = template.fill(&[
        ("query", query),
        ("context", context.unwrap_or("(none)")),
        ("instructions", instructions),
    ]);
    if let Some(suffix) = enrichment {
        instance.user.push_str(suffix);
    }
    instance
}

// =============================================================================
// Single-document judging
// =============================================================================

pub const JUDGE_V1: PromptTemplate = PromptTemplate {
    slug: "judge_v1",
    system: r#"You are an exacting document evaluator. You score one document against each listed criterion on a 0-10 scale, with a one-sentence reason per criterion.

Output only valid JSON:
{"scores": [{"criterion": "<name>", "score": <0-10>, "reason": "<why>"}, ...]}"#,
    user: r#"<query>
{query}
</query>

<criteria>
{criteria}
</criteria>

<document>
{document}
</document>

Return a JSON object with your scores.
json:"#,
};

/// Render a judge-scoring prompt for one artifact.
pub fn render_judge(query: &str, criteria: &[String], document: &str) -> PromptInstance {
    let criteria_list = criteria.join(", ");
    JUDGE_V1.fill(&[
        ("query", query),
        ("criteria", &criteria_list),
        ("document", document),
    ])
}

// =============================================================================
// Pairwise verdicts
// =============================================================================

pub const PAIRWISE_V1: PromptTemplate = PromptTemplate {
    slug: "pairwise_v1",
    system: r#"You are an exacting document evaluator. You compare two documents answering the same query and decide which is better overall: more accurate, more complete, better grounded, clearer.

Output only valid JSON `{"winner": "A"|"B", "reason": "<one sentence>"}`. If you genuinely cannot pick a winner, output `{"winner": null, "reason": "<why>"}`; we disprefer this.
Example:
{"winner": "B", "reason": "B cites primary sources and covers the counterargument."}"#,
    user: r#"<query>
{query}
</query>

<document_A>
{document_A}
</document_A>

<document_B>
{document_B}
</document_B>

Return a JSON object with your verdict.
json:"#,
};

/// Render a pairwise comparison prompt.
pub fn render_pairwise(query: &str, document_a: &str, document_b: &str) -> PromptInstance {
    PAIRWISE_V1.fill(&[
        ("query", query),
        ("document_A", document_a),
        ("document_B", document_b),
    ])
}

// =============================================================================
// Intelligent merge
// =============================================================================

pub const MERGE_V1: PromptTemplate = PromptTemplate {
    slug: "merge_v1",
    system: r#"You synthesize several candidate documents into a single superior document. Keep every well-grounded claim, drop contradictions and filler, preserve markdown structure."#,
    user: r#"<instruction>
{instruction}
</instruction>

<query>
{query}
</query>

{reports}

Write the merged document now."#,
};

/// Render the merge prompt. The synthesis instruction comes from run
/// configuration; there is no built-in default.
pub fn render_merge(instruction: &str, query: &str, reports: &[(String, String)]) -> PromptInstance {
    let mut blocks = String::new();
    for (i, (label, content)) in reports.iter().enumerate() {
        blocks.push_str(&format!(
            "<report_{n} source=\"{src}\">\n{body}\n</report_{n}>\n\n",
            n = i + 1,
            src = escape_xml_chars(label),
            body = escape_xml_chars(content),
        ));
    }
    // Reports are pre-escaped above, so fill() only handles the scalar slots.
    let mut instance = MERGE_V1.fill(&[("instruction", instruction), ("query", query)]);
    instance.user = instance.user.replace("{reports}", blocks.trim_end());
    instance
}

// =============================================================================
// TESTS
// =============================================================================

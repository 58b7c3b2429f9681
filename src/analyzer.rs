//! Structured file analysis over the generative-model boundary.
//!
//! Each media type maps to one of a closed set of analyzer variants via a
//! pure lookup — no dispatch hierarchy. The variant selects the prompt; the
//! model call and response handling are shared. Output that fails to parse
//! as structured JSON degrades to a best-effort result built from the raw
//! text instead of failing the job.

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::extract::{MIME_CSV, MIME_XLSX};
use crate::genai::{Attachment, GenerationOptions, GenerativeModel};
use crate::models::{Analysis, AnalysisMetadata, Importance, Insight};

/// Closed set of analysis variants. The set is known at compile time, so
/// selection is a match on the media type rather than virtual dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerKind {
    Document,
    Image,
    Code,
    Tabular,
}

const CODE_MEDIA_TYPES: &[&str] = &[
    "text/javascript",
    "text/typescript",
    "application/javascript",
    "application/typescript",
    "text/x-python",
    "text/x-java",
    "text/x-go",
    "text/x-rust",
    "application/json",
];

const TABULAR_MEDIA_TYPES: &[&str] = &[MIME_XLSX, "application/vnd.ms-excel", MIME_CSV];

impl AnalyzerKind {
    pub fn for_media_type(media_type: &str) -> Self {
        if media_type.starts_with("image/") {
            return AnalyzerKind::Image;
        }
        if CODE_MEDIA_TYPES.contains(&media_type) {
            return AnalyzerKind::Code;
        }
        if TABULAR_MEDIA_TYPES.contains(&media_type) {
            return AnalyzerKind::Tabular;
        }
        AnalyzerKind::Document
    }

    fn focus(&self) -> &'static str {
        match self {
            AnalyzerKind::Document => {
                "Focus on the document's argument, structure, and conclusions."
            }
            AnalyzerKind::Image => {
                "Describe what the image shows, any text it contains, and its likely purpose."
            }
            AnalyzerKind::Code => {
                "Focus on what the code does, its structure, notable dependencies, and potential issues."
            }
            AnalyzerKind::Tabular => {
                "Focus on what the data describes, column meanings, ranges, and notable patterns or outliers."
            }
        }
    }
}

/// Input to one analysis run: extracted text for text-bearing media, raw
/// bytes for images.
pub enum AnalysisInput<'a> {
    Text(&'a str),
    Image { media_type: &'a str, bytes: &'a [u8] },
}

/// Raw structured payload as the model emits it. Fields are optional so a
/// partially-conforming response still parses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisPayload {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    insights: Vec<InsightPayload>,
    #[serde(default)]
    metadata: Option<AnalysisMetadata>,
    #[serde(default)]
    relationships: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InsightPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_importance")]
    importance: Importance,
}

fn default_importance() -> Importance {
    Importance::Medium
}

pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// Run one analysis. Provider failures propagate (the job framework
    /// decides on retries); unparseable model output does not.
    pub async fn analyze(
        &self,
        model: &dyn GenerativeModel,
        file_id: Uuid,
        media_type: &str,
        input: AnalysisInput<'_>,
    ) -> Result<Analysis> {
        let kind = AnalyzerKind::for_media_type(media_type);
        let options = GenerationOptions {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: None,
        };

        let (prompt, attachment) = match input {
            AnalysisInput::Text(text) => {
                let capped = cap_chars(text, self.config.max_input_chars);
                (self.build_prompt(kind, media_type, Some(&capped)), None)
            }
            AnalysisInput::Image { media_type, bytes } => (
                self.build_prompt(kind, media_type, None),
                Some(Attachment { media_type, bytes }),
            ),
        };

        let raw = model.generate(&prompt, attachment, &options).await?;
        let payload = parse_structured(&raw).unwrap_or_else(|| fallback_payload(&raw));

        Ok(Analysis {
            id: Uuid::new_v4(),
            file_id,
            summary: payload.summary,
            key_points: payload.key_points,
            insights: payload
                .insights
                .into_iter()
                .map(|i| Insight {
                    title: i.title,
                    description: i.description,
                    importance: i.importance,
                })
                .collect(),
            metadata: payload.metadata.unwrap_or_default(),
            relationships: payload.relationships,
            model: self.config.model.clone(),
            created_at: Utc::now(),
        })
    }

    fn build_prompt(&self, kind: AnalyzerKind, media_type: &str, content: Option<&str>) -> String {
        let mut prompt = format!(
            r#"Analyze the following file content and respond with a single JSON object:

{{
  "summary": "brief summary of the content",
  "keyPoints": ["key point", ...],
  "insights": [{{"title": "...", "description": "...", "importance": "low|medium|high"}}],
  "metadata": {{"topics": ["..."], "language": "primary language", "sentiment": "positive|neutral|negative"}},
  "relationships": [{{"source": "...", "target": "...", "type": "...", "strength": 0.0}}]
}}

{}

File type: {}
"#,
            kind.focus(),
            media_type,
        );

        if let Some(content) = content {
            prompt.push_str("\nContent:\n");
            prompt.push_str(content);
        }

        prompt
    }
}

fn cap_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// Pull a JSON object out of the model's response: a ```json fence if
/// present, otherwise the outermost brace span.
fn parse_structured(raw: &str) -> Option<AnalysisPayload> {
    let candidate = extract_json_candidate(raw)?;
    serde_json::from_str(candidate).ok()
}

fn extract_json_candidate(raw: &str) -> Option<&str> {
    if let Some(fence_start) = raw.find("```json") {
        let after = &raw[fence_start + "```json".len()..];
        if let Some(fence_end) = after.find("```") {
            return Some(after[..fence_end].trim());
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}

/// Best-effort payload when the model did not return parseable JSON.
fn fallback_payload(raw: &str) -> AnalysisPayload {
    let head = |n: usize| -> String { raw.chars().take(n).collect() };
    AnalysisPayload {
        summary: head(500),
        key_points: vec![head(200)],
        insights: vec![InsightPayload {
            title: "Analysis".to_string(),
            description: head(300),
            importance: Importance::Medium,
        }],
        metadata: None,
        relationships: None,
    }
}

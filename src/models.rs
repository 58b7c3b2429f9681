//! Core data models for files, knowledge chunks, analyses, and search.
//!
//! These types flow through the processing pipeline (upload → analysis →
//! chunking → embedding → persistence) and the retrieval path (query →
//! similarity search → cited context).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing state of an uploaded file.
///
/// Transitions are owned by the analysis pipeline:
/// `Pending → Processing → {Completed, Failed}`. Re-analysis starts a fresh
/// run that resets the file to `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "processing" => Some(FileStatus::Processing),
            "completed" => Some(FileStatus::Completed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

/// A user-owned uploaded document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub media_type: String,
    pub size_bytes: i64,
    /// Locator understood by the object-storage boundary.
    pub storage_path: String,
    pub status: FileStatus,
    /// Last recorded processing error, present only for `Failed`.
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One embeddable unit of a file's extracted text.
///
/// Chunks for a file are created as a single batch per successful analysis
/// run and replaced wholesale on re-analysis. `chunk_index` is 0-based and
/// stable within the file.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// Importance level attached to an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
}

/// A single actionable insight from an analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub description: String,
    pub importance: Importance,
}

/// Topic/entity metadata attached to an analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
}

/// AI-generated structured result for one file. Immutable once written;
/// re-analysis replaces the row for the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub id: Uuid,
    pub file_id: Uuid,
    pub summary: String,
    pub key_points: Vec<String>,
    pub insights: Vec<Insight>,
    pub metadata: AnalysisMetadata,
    /// Raw entity-relationship graph, kept as provider-shaped JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<serde_json::Value>,
    /// Model identifier that produced this analysis.
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl Analysis {
    /// Flat text rendering used when a file has no extracted text of its
    /// own (images) and the knowledge base is built from the analysis.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.summary);
        for point in &self.key_points {
            out.push_str("\n\n");
            out.push_str(point);
        }
        for insight in &self.insights {
            out.push_str("\n\n");
            out.push_str(&insight.title);
            out.push_str(": ");
            out.push_str(&insight.description);
        }
        out
    }
}

/// A similarity-search hit. Ephemeral; consumed by the retriever.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub content: String,
    pub file_id: Uuid,
    /// Cosine similarity clamped to [0, 1].
    pub similarity: f64,
    pub chunk_index: i64,
    pub metadata: serde_json::Value,
}

/// One entry of a chat turn's finalized source list. The `citation` field
/// matches the `[n]` numbering used in the prompt's context blocks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub file_id: Uuid,
    pub file_name: String,
    pub snippet: String,
    pub similarity: f64,
    pub citation: usize,
}

/// A chat message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Map from file id to display name, used when rendering citations.
pub type FileNameMap = HashMap<Uuid, String>;

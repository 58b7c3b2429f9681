//! Grounded chat: retrieve context for the user's question, build the
//! system prompt with numbered citations, stream the model's answer, and
//! hand back the finalized source list.
//!
//! The source list is computed from the same ordered results that were
//! numbered into the prompt, before streaming starts — so citation `[i]`
//! in the generated text and entry `i` in the source list always refer to
//! the same chunk. That alignment is the correctness contract of the whole
//! retrieval feature and is covered by tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::genai::{GenerationOptions, GenerativeModel, TokenStream};
use crate::models::{ChatMessage, ChatRole, FileNameMap, SearchResult, SourceRef};
use crate::retriever::{build_context, Retriever, SearchOptions};

/// Length of the content preview carried in each source entry.
const SNIPPET_CHARS: usize = 200;

/// One answered turn: the finalized sources plus the token stream. Sources
/// are complete before the first token arrives, so callers can attach them
/// to response metadata ahead of the streamed body.
pub struct ChatTurn {
    pub sources: Vec<SourceRef>,
    pub stream: TokenStream,
}

pub struct ChatService {
    retriever: Arc<Retriever>,
    model: Arc<dyn GenerativeModel>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(retriever: Arc<Retriever>, model: Arc<dyn GenerativeModel>, config: ChatConfig) -> Self {
        Self {
            retriever,
            model,
            config,
        }
    }

    pub async fn answer(
        &self,
        user_id: Uuid,
        messages: &[ChatMessage],
        file_ids: Option<Vec<Uuid>>,
    ) -> Result<ChatTurn> {
        let question = last_user_message(messages)
            .ok_or_else(|| Error::Validation("conversation has no user message".into()))?;

        let opts = SearchOptions {
            user_id,
            file_ids,
            limit: self.config.context_limit,
            threshold: self.config.context_threshold,
        };
        let results = self.retriever.search(question, &opts).await?;
        let names = self.retriever.file_names(user_id, &results).await?;

        let system = build_system_prompt(&results, &names);
        let sources = build_sources(&results, &names);

        let options = GenerationOptions {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: Some(self.config.max_tokens),
        };
        let stream = self.model.stream_chat(&system, messages, &options).await?;

        Ok(ChatTurn { sources, stream })
    }
}

fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
}

/// System instruction with the numbered context embedded. With no
/// retrieved context the model is told outright that no documents are
/// available, which keeps it from inventing citations.
pub fn build_system_prompt(results: &[SearchResult], names: &FileNameMap) -> String {
    if results.is_empty() {
        return "You are a helpful AI assistant. The user has not uploaded any files yet, \
                so you cannot reference specific documents."
            .to_string();
    }

    let context = build_context(results, names);
    format!(
        r#"You are a helpful AI assistant with access to the user's uploaded files and documents.

CONTEXT FROM USER'S KNOWLEDGE BASE:

{context}

INSTRUCTIONS:

1. Answer the user's question using the context provided above
2. Cite your sources using [1], [2], etc. when referencing information
3. If the context doesn't contain relevant information, say so clearly
4. Be specific and quote exact phrases from the context when appropriate
5. If asked to compare or analyze, use information from multiple sources

Always prioritize accuracy over completeness. If you're unsure, acknowledge it."#
    )
}

/// Source list entries in result order; `citation` is the 1-based index
/// used in the prompt's context blocks.
pub fn build_sources(results: &[SearchResult], names: &FileNameMap) -> Vec<SourceRef> {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| SourceRef {
            file_id: result.file_id,
            file_name: names
                .get(&result.file_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string()),
            snippet: snippet(&result.content),
            similarity: result.similarity,
            citation: i + 1,
        })
        .collect()
}

fn snippet(content: &str) -> String {
    if content.chars().count() <= SNIPPET_CHARS {
        return content.to_string();
    }
    let mut out: String = content.chars().take(SNIPPET_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(file_id: Uuid, index: i64, content: &str, similarity: f64) -> SearchResult {
        SearchResult {
            content: content.into(),
            file_id,
            similarity,
            chunk_index: index,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn citation_indices_match_prompt_numbering() {
        let file_a = Uuid::from_u128(1);
        let file_b = Uuid::from_u128(2);
        let results = vec![
            result(file_a, 0, "First chunk.", 0.95),
            result(file_b, 1, "Second chunk.", 0.85),
            result(file_a, 2, "Third chunk.", 0.80),
        ];
        let mut names = FileNameMap::new();
        names.insert(file_a, "a.txt".into());
        names.insert(file_b, "b.txt".into());

        let prompt = build_system_prompt(&results, &names);
        let sources = build_sources(&results, &names);

        assert_eq!(sources.len(), 3);
        for (i, source) in sources.iter().enumerate() {
            assert_eq!(source.citation, i + 1);
            // The block numbered [i+1] in the prompt carries this source's
            // chunk content.
            let marker = format!("[{}] From \"{}\":", i + 1, source.file_name);
            let block_start = prompt.find(&marker).unwrap();
            let content = &results[i].content;
            assert_eq!(
                &prompt[block_start + marker.len() + 1..block_start + marker.len() + 1 + content.len()],
                content.as_str()
            );
        }
    }

    #[test]
    fn empty_context_prompt_disclaims_documents() {
        let prompt = build_system_prompt(&[], &FileNameMap::new());
        assert!(prompt.contains("has not uploaded any files"));
        assert!(!prompt.contains("CONTEXT FROM USER'S KNOWLEDGE BASE"));
    }

    #[test]
    fn snippets_truncate_at_200_chars_with_marker() {
        let long = "x".repeat(450);
        let results = vec![result(Uuid::from_u128(3), 0, &long, 0.9)];
        let sources = build_sources(&results, &FileNameMap::new());

        assert_eq!(sources[0].snippet.chars().count(), 201);
        assert!(sources[0].snippet.ends_with('…'));

        let short = "short content";
        let results = vec![result(Uuid::from_u128(3), 0, short, 0.9)];
        let sources = build_sources(&results, &FileNameMap::new());
        assert_eq!(sources[0].snippet, short);
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let messages = vec![
            ChatMessage {
                role: ChatRole::User,
                content: "first".into(),
            },
            ChatMessage {
                role: ChatRole::Assistant,
                content: "reply".into(),
            },
            ChatMessage {
                role: ChatRole::User,
                content: "second".into(),
            },
            ChatMessage {
                role: ChatRole::Assistant,
                content: "trailing".into(),
            },
        ];
        assert_eq!(last_user_message(&messages), Some("second"));
    }
}

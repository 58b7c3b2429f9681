//! Test doubles for the external boundaries: embedding provider,
//! generative model, and object storage.
//!
//! These are deterministic and offline; unit tests and the integration
//! suite inject them in place of the HTTP implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::genai::{Attachment, GenerationOptions, GenerativeModel, TokenStream};
use crate::models::ChatMessage;
use crate::storage::ObjectStore;

/// Deterministic embedder: the vector is derived from a SHA-256 of the
/// (truncated) input, so equal texts embed equally and different texts
/// almost surely do not. Counts calls so tests can assert the no-call
/// paths.
pub struct CountingEmbedder {
    dims: usize,
    calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting-test-embedder"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Validation("cannot embed empty input".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();

        let mut vector = Vec::with_capacity(self.dims);
        for i in 0..self.dims {
            let byte = digest[i % digest.len()].wrapping_add(i as u8);
            vector.push(byte as f32 / 255.0);
        }
        Ok(vector)
    }
}

/// Generative model with a scripted one-shot response and scripted stream
/// tokens. Records the prompts it was asked to generate from.
pub struct ScriptedModel {
    pub response: String,
    pub stream_tokens: Vec<String>,
    prompts: Mutex<Vec<String>>,
    systems: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            stream_tokens: Vec::new(),
            prompts: Mutex::new(Vec::new()),
            systems: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stream(mut self, tokens: &[&str]) -> Self {
        self.stream_tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn systems(&self) -> Vec<String> {
        self.systems.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    async fn generate(
        &self,
        prompt: &str,
        _attachment: Option<Attachment<'_>>,
        _options: &GenerationOptions,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.response.clone())
    }

    async fn stream_chat(
        &self,
        system: &str,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> Result<TokenStream> {
        self.systems.lock().unwrap().push(system.to_string());
        let tokens: Vec<Result<String>> =
            self.stream_tokens.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(tokens)))
    }
}

/// Generative model whose every call fails with the given error kind.
pub struct FailingModel {
    pub transient: bool,
}

#[async_trait]
impl GenerativeModel for FailingModel {
    async fn generate(
        &self,
        _prompt: &str,
        _attachment: Option<Attachment<'_>>,
        _options: &GenerationOptions,
    ) -> Result<String> {
        if self.transient {
            Err(Error::TransientProvider("model timed out".into()))
        } else {
            Err(Error::PermanentProvider("model rejected request".into()))
        }
    }

    async fn stream_chat(
        &self,
        _system: &str,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> Result<TokenStream> {
        Err(Error::TransientProvider("model timed out".into()))
    }
}

/// In-memory object store. Can be configured to fail a number of downloads
/// first (timeouts), to exercise the retry path.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    download_failures: AtomicUsize,
    download_attempts: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` downloads with a transient timeout.
    pub fn fail_downloads(self, n: usize) -> Self {
        self.download_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn download_attempts(&self) -> usize {
        self.download_attempts.load(Ordering::SeqCst)
    }

    pub fn put(&self, locator: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(locator.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        self.download_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.download_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.download_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientProvider(format!(
                "download of {locator} timed out"
            )));
        }

        self.objects
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object not found: {locator}")))
    }

    async fn upload(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        self.put(locator, bytes);
        Ok(())
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(locator);
        Ok(())
    }
}

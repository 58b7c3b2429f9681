//! End-to-end scenarios for the processing pipeline, worker, retrieval,
//! and chat — all over in-memory/offline implementations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use filesense::analyzer::Analyzer;
use filesense::chat::ChatService;
use filesense::chunk::Chunker;
use filesense::config::{AnalysisConfig, ChatConfig, WorkerConfig};
use filesense::db;
use filesense::error::{Error, Result};
use filesense::genai::GenerativeModel;
use filesense::migrate;
use filesense::models::{ChatMessage, ChatRole, FileRecord, FileStatus};
use filesense::pipeline::Pipeline;
use filesense::queue::{JobQueue, ProcessJob, SqliteQueue};
use filesense::retriever::{Retriever, SearchOptions};
use filesense::storage::ObjectStore;
use filesense::store::{InMemoryStore, Store};
use filesense::testing::{CountingEmbedder, MemoryStorage, ScriptedModel};
use filesense::worker::{run_job, Worker};

const ANALYSIS_JSON: &str = r#"{
  "summary": "A short report about alpacas.",
  "keyPoints": ["Alpacas hum.", "Alpacas are herd animals."],
  "insights": [
    {"title": "Humming", "description": "Humming signals contentment.", "importance": "medium"}
  ],
  "metadata": {"topics": ["alpacas"], "language": "en"}
}"#;

fn analysis_config() -> AnalysisConfig {
    AnalysisConfig {
        model: "test-model".into(),
        base_url: None,
        max_input_chars: 50_000,
        temperature: 0.3,
        timeout_secs: 30,
        max_retries: 3,
    }
}

fn chat_config() -> ChatConfig {
    ChatConfig {
        model: "test-model".into(),
        base_url: None,
        temperature: 0.7,
        max_tokens: 512,
        context_limit: 5,
        context_threshold: 0.0,
        timeout_secs: 30,
    }
}

fn make_file(user_id: Uuid, name: &str, media_type: &str) -> FileRecord {
    FileRecord {
        id: Uuid::new_v4(),
        user_id,
        name: name.into(),
        media_type: media_type.into(),
        size_bytes: 64,
        storage_path: format!("{user_id}/{name}"),
        status: FileStatus::Pending,
        error: None,
        metadata: serde_json::json!({}),
        created_at: Utc::now(),
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    storage: Arc<MemoryStorage>,
    embedder: Arc<CountingEmbedder>,
    pipeline: Arc<Pipeline>,
}

fn harness_with(storage: MemoryStorage, model: Arc<dyn GenerativeModel>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let storage = Arc::new(storage);
    let embedder = Arc::new(CountingEmbedder::new(8));
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        storage.clone(),
        embedder.clone(),
        model,
        Analyzer::new(analysis_config()),
        Chunker::new(1000, 200).unwrap(),
    ));
    Harness {
        store,
        storage,
        embedder,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(
        MemoryStorage::new(),
        Arc::new(ScriptedModel::new(ANALYSIS_JSON)),
    )
}

async fn enqueue_and_claim(queue: &SqliteQueue, file: &FileRecord) -> filesense::queue::ClaimedJob {
    queue
        .enqueue(&ProcessJob {
            file_id: file.id,
            user_id: file.user_id,
        })
        .await
        .unwrap();
    queue.claim(1).await.unwrap().pop().expect("job ready")
}

async fn test_queue() -> SqliteQueue {
    let pool = db::connect_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    // Zero backoff keeps retried jobs immediately claimable in tests.
    SqliteQueue::new(pool, 3, 0)
}

#[tokio::test]
async fn happy_path_processes_to_completed() {
    let h = harness();
    let queue = test_queue().await;
    let user = Uuid::new_v4();
    let file = make_file(user, "alpacas.txt", "text/plain");

    h.store.create_file(&file).await.unwrap();
    h.storage.put(
        &file.storage_path,
        b"Alpacas hum when they are content. They live in herds.",
    );

    let job = enqueue_and_claim(&queue, &file).await;
    run_job(
        Arc::new(queue),
        h.store.clone(),
        h.pipeline.clone(),
        job,
    )
    .await;

    let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Completed);
    assert!(loaded.error.is_none());

    let analysis = h.store.get_analysis(user, file.id).await.unwrap().unwrap();
    assert_eq!(analysis.summary, "A short report about alpacas.");
    assert_eq!(analysis.key_points.len(), 2);

    // Short text, one chunk, one embedding call for it.
    assert_eq!(h.store.chunk_count(file.id), 1);
    assert_eq!(h.embedder.calls(), 1);
}

#[tokio::test]
async fn completed_file_is_fully_searchable() {
    let h = harness();
    let queue = test_queue().await;
    let user = Uuid::new_v4();
    let file = make_file(user, "long.txt", "text/plain");

    // Long enough for several overlapping chunks.
    let body = "Interesting sentence about retrieval. ".repeat(80);
    h.store.create_file(&file).await.unwrap();
    h.storage.put(&file.storage_path, body.as_bytes());

    let job = enqueue_and_claim(&queue, &file).await;
    run_job(Arc::new(queue), h.store.clone(), h.pipeline.clone(), job).await;

    let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Completed);

    let chunk_count = h.store.chunk_count(file.id);
    assert!(chunk_count > 1, "expected multiple chunks, got {chunk_count}");

    // Read-after-write: a query against the completed file observes the
    // full chunk set.
    let retriever = Retriever::new(h.embedder.clone(), h.store.clone());
    let results = retriever
        .search(
            "retrieval",
            &SearchOptions {
                user_id: user,
                file_ids: Some(vec![file.id]),
                limit: 100,
                threshold: 0.0,
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), chunk_count);
}

#[tokio::test]
async fn download_timeouts_exhaust_retries_and_fail_the_file() {
    let h = harness_with(
        MemoryStorage::new().fail_downloads(10),
        Arc::new(ScriptedModel::new(ANALYSIS_JSON)),
    );
    let queue = Arc::new(test_queue().await);
    let user = Uuid::new_v4();
    let file = make_file(user, "flaky.txt", "text/plain");
    h.store.create_file(&file).await.unwrap();

    queue
        .enqueue(&ProcessJob {
            file_id: file.id,
            user_id: user,
        })
        .await
        .unwrap();

    // Drain the queue the way the worker loop would.
    loop {
        let Some(job) = queue.claim(1).await.unwrap().pop() else {
            break;
        };
        run_job(queue.clone(), h.store.clone(), h.pipeline.clone(), job).await;
    }

    let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Failed);
    let error = loaded.error.expect("failure must record an error");
    assert!(error.contains("timed out"), "unexpected error: {error}");

    // Attempt budget is 3: exactly three downloads were tried.
    assert_eq!(h.storage.download_attempts(), 3);
    assert_eq!(h.store.chunk_count(file.id), 0);
}

/// Object store that deletes the file record out from under the job before
/// returning bytes, simulating a user deletion racing with processing.
struct DeletingStorage {
    inner: MemoryStorage,
    store: Arc<InMemoryStore>,
    user_id: Uuid,
    file_id: Uuid,
}

#[async_trait::async_trait]
impl ObjectStore for DeletingStorage {
    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        self.store.delete_file(self.user_id, self.file_id).await?;
        self.inner.download(locator).await
    }

    async fn upload(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        self.inner.upload(locator, bytes).await
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        self.inner.delete(locator).await
    }
}

#[tokio::test]
async fn delete_during_processing_terminates_without_chunks() {
    let store = Arc::new(InMemoryStore::new());
    let user = Uuid::new_v4();
    let file = make_file(user, "doomed.txt", "text/plain");
    store.create_file(&file).await.unwrap();

    let inner = MemoryStorage::new();
    inner.put(&file.storage_path, b"some text to analyze");
    let storage = Arc::new(DeletingStorage {
        inner,
        store: store.clone(),
        user_id: user,
        file_id: file.id,
    });

    let embedder = Arc::new(CountingEmbedder::new(8));
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        storage,
        embedder,
        Arc::new(ScriptedModel::new(ANALYSIS_JSON)),
        Analyzer::new(analysis_config()),
        Chunker::new(1000, 200).unwrap(),
    ));

    let queue = Arc::new(test_queue().await);
    let job = enqueue_and_claim(&queue, &file).await;

    // Must not panic; the job ends terminally without writing chunks.
    run_job(queue.clone(), store.clone(), pipeline, job).await;

    assert_eq!(store.chunk_count(file.id), 0);
    assert!(store.get_file(user, file.id).await.unwrap().is_none());
    assert!(queue.claim(1).await.unwrap().is_empty(), "job must not retry");
}

#[tokio::test]
async fn reanalysis_replaces_chunks_and_analysis() {
    let h = harness();
    let user = Uuid::new_v4();
    let file = make_file(user, "evolving.txt", "text/plain");
    h.store.create_file(&file).await.unwrap();
    h.storage
        .put(&file.storage_path, "first version of the text".as_bytes());

    // First run.
    let queue = Arc::new(test_queue().await);
    let job = enqueue_and_claim(&queue, &file).await;
    run_job(queue.clone(), h.store.clone(), h.pipeline.clone(), job).await;
    assert_eq!(h.store.chunk_count(file.id), 1);

    // Re-upload with a longer body, then re-analyze.
    let body = "second version, considerably longer. ".repeat(60);
    h.storage.put(&file.storage_path, body.as_bytes());
    let job = enqueue_and_claim(&queue, &file).await;
    run_job(queue.clone(), h.store.clone(), h.pipeline.clone(), job).await;

    let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Completed);

    // One analysis, one non-duplicated chunk set from the second run.
    let retriever = Retriever::new(h.embedder.clone(), h.store.clone());
    let results = retriever
        .search(
            "version",
            &SearchOptions {
                user_id: user,
                file_ids: Some(vec![file.id]),
                limit: 100,
                threshold: 0.0,
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), h.store.chunk_count(file.id));
    assert!(results.iter().all(|r| r.content.contains("second version")));

    let mut indices: Vec<i64> = results.iter().map(|r| r.chunk_index).collect();
    indices.sort();
    indices.dedup();
    assert_eq!(indices.len(), results.len(), "chunk indices must be unique");
}

#[tokio::test]
async fn image_files_skip_extraction_and_index_the_analysis() {
    let h = harness();
    let queue = test_queue().await;
    let user = Uuid::new_v4();
    let file = make_file(user, "photo.png", "image/png");

    h.store.create_file(&file).await.unwrap();
    h.storage.put(&file.storage_path, &[0x89, 0x50, 0x4e, 0x47]);

    let job = enqueue_and_claim(&queue, &file).await;
    run_job(Arc::new(queue), h.store.clone(), h.pipeline.clone(), job).await;

    let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Completed);

    // Knowledge comes from the analysis text, not extraction.
    let retriever = Retriever::new(h.embedder.clone(), h.store.clone());
    let results = retriever
        .search(
            "alpacas",
            &SearchOptions {
                user_id: user,
                file_ids: Some(vec![file.id]),
                limit: 10,
                threshold: 0.0,
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].content.contains("alpacas"));
}

#[tokio::test]
async fn unparseable_model_output_degrades_instead_of_failing() {
    let h = harness_with(
        MemoryStorage::new(),
        Arc::new(ScriptedModel::new(
            "The model rambled and returned no JSON at all.",
        )),
    );
    let queue = test_queue().await;
    let user = Uuid::new_v4();
    let file = make_file(user, "rambling.txt", "text/plain");

    h.store.create_file(&file).await.unwrap();
    h.storage.put(&file.storage_path, b"document body");

    let job = enqueue_and_claim(&queue, &file).await;
    run_job(Arc::new(queue), h.store.clone(), h.pipeline.clone(), job).await;

    let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, FileStatus::Completed);

    let analysis = h.store.get_analysis(user, file.id).await.unwrap().unwrap();
    assert!(analysis.summary.starts_with("The model rambled"));
}

#[tokio::test]
async fn worker_pool_processes_independent_files_concurrently() {
    let h = harness();
    let queue = Arc::new(test_queue().await);
    let user = Uuid::new_v4();

    let mut files = Vec::new();
    for i in 0..4 {
        let file = make_file(user, &format!("doc{i}.txt"), "text/plain");
        h.store.create_file(&file).await.unwrap();
        h.storage
            .put(&file.storage_path, format!("body of document {i}").as_bytes());
        queue
            .enqueue(&ProcessJob {
                file_id: file.id,
                user_id: user,
            })
            .await
            .unwrap();
        files.push(file);
    }

    let worker = Worker::new(
        queue.clone(),
        h.store.clone(),
        h.pipeline.clone(),
        WorkerConfig {
            concurrency: 5,
            poll_interval_ms: 10,
            max_attempts: 3,
            backoff_base_secs: 0,
            orphan_after_secs: 3600,
        },
    );

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    // Wait for all files to reach a terminal state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut done = 0;
        for file in &files {
            let loaded = h.store.get_file(user, file.id).await.unwrap().unwrap();
            if loaded.status == FileStatus::Completed {
                done += 1;
            }
        }
        if done == files.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker did not finish {done}/{} files in time",
            files.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn chat_turn_streams_and_cites_in_matching_order() {
    let h = harness();
    let queue = test_queue().await;
    let user = Uuid::new_v4();
    let file = make_file(user, "kb.txt", "text/plain");

    h.store.create_file(&file).await.unwrap();
    h.storage
        .put(&file.storage_path, b"Alpacas hum when they are content.");

    let job = enqueue_and_claim(&queue, &file).await;
    run_job(Arc::new(queue), h.store.clone(), h.pipeline.clone(), job).await;

    let retriever = Arc::new(Retriever::new(h.embedder.clone(), h.store.clone()));
    let chat_model = Arc::new(
        ScriptedModel::new("").with_stream(&["Alpacas ", "hum ", "[1]."]),
    );
    let chat = ChatService::new(retriever, chat_model.clone(), chat_config());

    let messages = vec![ChatMessage {
        role: ChatRole::User,
        content: "Why do alpacas hum?".into(),
    }];
    let turn = chat.answer(user, &messages, None).await.unwrap();

    // Sources are finalized before streaming and numbered from 1 in
    // retrieval order.
    assert!(!turn.sources.is_empty());
    for (i, source) in turn.sources.iter().enumerate() {
        assert_eq!(source.citation, i + 1);
        assert_eq!(source.file_name, "kb.txt");
    }

    let text: String = turn
        .stream
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await
        .join("");
    assert_eq!(text, "Alpacas hum [1].");

    // The prompt the model saw embeds the same numbering.
    let systems = chat_model.systems();
    assert_eq!(systems.len(), 1);
    assert!(systems[0].contains("[1] From \"kb.txt\":"));
}

#[tokio::test]
async fn chat_without_context_gets_the_no_documents_prompt() {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(CountingEmbedder::new(8));
    let retriever = Arc::new(Retriever::new(embedder, store));
    let chat_model = Arc::new(ScriptedModel::new("").with_stream(&["I have no documents."]));
    let chat = ChatService::new(retriever, chat_model.clone(), chat_config());

    let messages = vec![ChatMessage {
        role: ChatRole::User,
        content: "What do my files say?".into(),
    }];
    let turn = chat
        .answer(Uuid::new_v4(), &messages, None)
        .await
        .unwrap();

    assert!(turn.sources.is_empty());
    let systems = chat_model.systems();
    assert!(systems[0].contains("has not uploaded any files"));
}

#[tokio::test]
async fn search_never_crosses_tenants_end_to_end() {
    let h = harness();
    let queue = Arc::new(test_queue().await);
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();

    for (user, name) in [(user_a, "a.txt"), (user_b, "b.txt")] {
        let file = make_file(user, name, "text/plain");
        h.store.create_file(&file).await.unwrap();
        h.storage
            .put(&file.storage_path, b"shared secret phrase: tenants");
        let job = enqueue_and_claim(&queue, &file).await;
        run_job(queue.clone(), h.store.clone(), h.pipeline.clone(), job).await;
    }

    let retriever = Retriever::new(h.embedder.clone(), h.store.clone());
    let results = retriever
        .search(
            "shared secret phrase",
            &SearchOptions {
                user_id: user_a,
                file_ids: None,
                limit: 100,
                threshold: 0.0,
            },
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    let names = retriever.file_names(user_a, &results).await.unwrap();
    assert!(names.values().all(|n| n == "a.txt"));
}

#[tokio::test]
async fn missing_file_record_fails_without_retry() {
    let h = harness();
    let queue = Arc::new(test_queue().await);
    let ghost = make_file(Uuid::new_v4(), "ghost.txt", "text/plain");

    // No create_file: the record never existed.
    let job = enqueue_and_claim(&queue, &ghost).await;
    let err = h.pipeline.process(&job).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(!err.is_retryable());
}

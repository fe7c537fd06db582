//! LLM work handed to a bounded worker pool.
//!
//! The LLM action is the producer: it submits an [`AiTask`] through an
//! [`AiTaskClient`] and waits, bounded, for the [`AiResult`] with the same
//! task id. [`AiWorkerPool`] is the consumer: it pulls tasks, calls the
//! provider, and always completes the task, turning provider errors into a
//! failure result so the producer never waits for nothing.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue::{Correlator, QueueError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::{NodeError, ProviderKind};

/// Correlator carrying AI tasks to the worker pool and results back.
pub type AiCorrelator = Correlator<AiTask, AiResult>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiTask {
    pub task_id: String,
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub api_key: String,
    pub provider: ProviderKind,
    /// Provider API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    #[serde(default)]
    pub http_referer: Option<String>,
    #[serde(default)]
    pub x_title: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Debug for AiTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiTask")
            .field("task_id", &self.task_id)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResult {
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AiResult {
    pub fn failure(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            usage: None,
            model: model.into(),
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Submits tasks and waits for their results, bounded by `timeout`.
#[derive(Clone)]
pub struct AiTaskClient {
    correlator: Arc<AiCorrelator>,
    timeout: Duration,
}

impl AiTaskClient {
    pub fn new(correlator: Arc<AiCorrelator>, timeout: Duration) -> Self {
        Self {
            correlator,
            timeout,
        }
    }

    /// Enqueue `task` and wait for its result.
    ///
    /// # Errors
    /// [`NodeError::Timeout`] when no result arrives in time; any other
    /// queue failure becomes [`NodeError::AiTask`].
    pub async fn submit(&self, task: AiTask) -> Result<AiResult, NodeError> {
        let task_id = task.task_id.clone();
        self.correlator
            .request(&task_id, task, self.timeout)
            .await
            .map_err(|e| match e {
                QueueError::Timeout { after, .. } => NodeError::Timeout(after),
                other => NodeError::AiTask(other.to_string()),
            })
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// One completion call against an LLM provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, task: &AiTask) -> Result<AiResult, NodeError>;
}

/// Speaks the OpenAI chat-completions dialect, which both provider variants
/// accept; they differ only in base URL and a couple of headers.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, task: &AiTask) -> Result<AiResult, NodeError> {
        let url = format!("{}/chat/completions", task.base_url.trim_end_matches('/'));
        let body = json!({
            "model": task.model,
            "messages": [{ "role": "user", "content": task.prompt }],
            "temperature": task.temperature,
            "max_tokens": task.max_tokens,
        });

        let mut req = self
            .client
            .post(&url)
            .bearer_auth(&task.api_key)
            .json(&body);
        if task.provider == ProviderKind::OpenRouter {
            req = req
                .header("HTTP-Referer", task.http_referer.as_deref().unwrap_or(""))
                .header("X-Title", task.x_title.as_deref().unwrap_or(""));
        }

        let resp = req.send().await.map_err(|e| e.without_url())?;
        let status = resp.status();
        let payload: Value = resp.json().await.map_err(|e| e.without_url())?;

        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(NodeError::Api {
                service: service_name(task.provider),
                message,
            });
        }

        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let usage = payload.get("usage").map(|u| {
            let count = |key: &str| u.get(key).and_then(Value::as_u64).unwrap_or(0);
            TokenUsage {
                input_tokens: count("prompt_tokens"),
                output_tokens: count("completion_tokens"),
                total_tokens: count("total_tokens"),
            }
        });

        Ok(AiResult {
            success: true,
            content,
            usage,
            model: task.model.clone(),
            error: None,
        })
    }
}

fn service_name(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::OpenAi => "OpenAI",
        ProviderKind::OpenRouter => "OpenRouter",
    }
}

/// Default bound on one provider call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Fixed-size pool draining the AI task queue.
pub struct AiWorkerPool {
    correlator: Arc<AiCorrelator>,
    provider: Arc<dyn LlmProvider>,
    concurrency: usize,
    call_timeout: Duration,
}

impl AiWorkerPool {
    pub fn new(
        correlator: Arc<AiCorrelator>,
        provider: Arc<dyn LlmProvider>,
        concurrency: usize,
    ) -> Self {
        Self {
            correlator,
            provider,
            concurrency: concurrency.max(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// A provider call running longer than this fails the task and frees
    /// its slot.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Pull and process tasks until the queue is closed, then wait for the
    /// tasks still in flight.
    pub async fn run(&self) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        info!(concurrency = self.concurrency, "AI worker pool started");

        loop {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let job = match self.correlator.next_task().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to dequeue AI task");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let correlator = self.correlator.clone();
            let provider = self.provider.clone();
            let call_timeout = self.call_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                let task = job.payload;
                let result = process(provider.as_ref(), &task, call_timeout).await;
                if !correlator.complete(&task.task_id, result) {
                    warn!(task_id = %task.task_id, "AI result discarded, producer gone");
                }
            });
        }

        // Drain: every permit back means every spawned task finished.
        let total = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(total).await;
        info!("AI worker pool stopped");
    }
}

async fn process(provider: &dyn LlmProvider, task: &AiTask, call_timeout: Duration) -> AiResult {
    let started = Instant::now();
    info!(task_id = %task.task_id, model = %task.model, provider = ?task.provider, "processing AI task");

    let outcome = tokio::time::timeout(call_timeout, provider.complete(task))
        .await
        .unwrap_or(Err(NodeError::Timeout(call_timeout)));
    match outcome {
        Ok(result) => {
            info!(
                task_id = %task.task_id,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                total_tokens = result.usage.as_ref().map(|u| u.total_tokens),
                "AI task completed"
            );
            result
        }
        Err(e) => {
            error!(task_id = %task.task_id, error = %e, "AI task failed");
            AiResult::failure(task.model.clone(), e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use queue::{JobQueue, MemoryQueue};

    fn task(id: &str) -> AiTask {
        AiTask {
            task_id: id.into(),
            prompt: "Say hi".into(),
            model: "gpt-5-mini".into(),
            temperature: 0.7,
            max_tokens: 1000,
            api_key: "sk-test".into(),
            provider: ProviderKind::OpenAi,
            base_url: "http://unused".into(),
            http_referer: None,
            x_title: None,
            timestamp: Utc::now(),
        }
    }

    fn pool_parts() -> (Arc<MemoryQueue<AiTask>>, Arc<AiCorrelator>) {
        let tasks = Arc::new(MemoryQueue::new());
        let correlator = Arc::new(Correlator::new(tasks.clone() as Arc<dyn JobQueue<AiTask>>));
        (tasks, correlator)
    }

    #[tokio::test]
    async fn pool_answers_submitted_tasks() {
        let (tasks, correlator) = pool_parts();
        let provider = Arc::new(MockProvider::replying("hello there"));
        let pool = AiWorkerPool::new(correlator.clone(), provider.clone(), 2);
        let handle = tokio::spawn(async move { pool.run().await });

        let client = AiTaskClient::new(correlator, Duration::from_secs(5));
        let result = client.submit(task("t-1")).await.unwrap();

        assert!(result.success);
        assert_eq!(result.content, "hello there");
        assert_eq!(provider.call_count(), 1);

        tasks.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn provider_errors_become_failure_results() {
        let (tasks, correlator) = pool_parts();
        let provider = Arc::new(MockProvider::failing("rate limited"));
        let pool = AiWorkerPool::new(correlator.clone(), provider, 1);
        let handle = tokio::spawn(async move { pool.run().await });

        let client = AiTaskClient::new(correlator, Duration::from_secs(5));
        let result = client.submit(task("t-2")).await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("rate limited"));

        tasks.close();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_worker_means_timeout() {
        let (_queue, correlator) = pool_parts();
        let client = AiTaskClient::new(correlator, Duration::from_secs(120));

        let err = client.submit(task("t-3")).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout(d) if d == Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn openrouter_requests_carry_attribution_headers() {
        use axum::{http::HeaderMap, routing::post, Json, Router};

        let app = Router::new().route(
            "/api/v1/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["authorization"], "Bearer sk-test");
                assert_eq!(headers["http-referer"], "https://example.com");
                assert_eq!(headers["x-title"], "Flows");
                assert_eq!(body["model"], "openai/gpt-5-mini");
                Json(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "pong" } }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 }
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut t = task("t-4");
        t.provider = ProviderKind::OpenRouter;
        t.model = "openai/gpt-5-mini".into();
        t.base_url = format!("http://{addr}/api/v1");
        t.http_referer = Some("https://example.com".into());
        t.x_title = Some("Flows".into());

        let result = OpenAiCompatibleProvider::new(reqwest::Client::new())
            .complete(&t)
            .await
            .unwrap();

        assert_eq!(result.content, "pong");
        assert_eq!(result.usage.unwrap().total_tokens, 4);
    }

    #[tokio::test]
    async fn stalled_provider_call_frees_its_worker() {
        use axum::{routing::post, Json, Router};

        let app = Router::new()
            .route(
                "/stalled/chat/completions",
                post(|| async {
                    std::future::pending::<()>().await;
                    Json(json!({}))
                }),
            )
            .route(
                "/live/chat/completions",
                post(|| async {
                    Json(json!({ "choices": [{ "message": { "content": "pong" } }] }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let (tasks, correlator) = pool_parts();
        let provider = Arc::new(OpenAiCompatibleProvider::new(reqwest::Client::new()));
        let pool = AiWorkerPool::new(correlator.clone(), provider, 1)
            .with_call_timeout(Duration::from_millis(300));
        let handle = tokio::spawn(async move { pool.run().await });
        let client = AiTaskClient::new(correlator, Duration::from_secs(10));

        let mut stalled = task("t-6");
        stalled.base_url = format!("http://{addr}/stalled");
        let result = client.submit(stalled).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));

        // The single worker slot is free again.
        let mut live = task("t-7");
        live.base_url = format!("http://{addr}/live");
        let result = client.submit(live).await.unwrap();
        assert!(result.success);
        assert_eq!(result.content, "pong");

        tasks.close();
        handle.await.unwrap();
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        assert!(!format!("{:?}", task("t-5")).contains("sk-test"));
    }
}

//! Built-in jobs registered at start-up.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{Job, JobContext, JobError, JobResult, RetryPolicy};

/// Job: `increment(value) -> value + 1`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncrementJob {
    /// Artificial work time before answering
    #[serde(with = "humantime_serde", default)]
    pub delay: Duration,
}

impl IncrementJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Job for IncrementJob {
    fn name(&self) -> &'static str {
        "increment"
    }

    async fn execute(&self, ctx: &JobContext, args: &[serde_json::Value]) -> JobResult {
        let value = args
            .first()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| JobError::fatal("increment expects one integer argument").with_code("BAD_ARGS"))?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = value
            .checked_add(1)
            .ok_or_else(|| JobError::fatal("integer overflow").with_code("OVERFLOW"))?;
        ctx.log_info(&format!("incremented {} to {}", value, next));
        Ok(serde_json::json!(next))
    }

    fn retry_policy(&self) -> RetryPolicy {
        // Idempotent.
        RetryPolicy::exponential_backoff(2)
    }
}

/// Stand-in text-generation model.
#[derive(Debug)]
pub struct TextModel {
    name: String,
}

impl TextModel {
    fn load(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generate(&self, _prompt: &str) -> String {
        "World!".to_string()
    }
}

/// Job: `predict_text(prompt) -> completion`.
///
/// The model is loaded once, on the first invocation this process handles.
#[derive(Debug, Clone)]
pub struct PredictTextJob {
    model_name: String,
    model: Arc<OnceCell<TextModel>>,
    loads: Arc<AtomicU64>,
}

impl PredictTextJob {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model: Arc::new(OnceCell::new()),
            loads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of times the model has been loaded.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    async fn model(&self) -> &TextModel {
        self.model
            .get_or_init(|| async {
                tracing::info!(model = %self.model_name, "Loading text model");
                self.loads.fetch_add(1, Ordering::Relaxed);
                TextModel::load(&self.model_name)
            })
            .await
    }
}

impl Default for PredictTextJob {
    fn default() -> Self {
        Self::new("gpt2")
    }
}

#[async_trait]
impl Job for PredictTextJob {
    fn name(&self) -> &'static str {
        "predict_text"
    }

    async fn execute(&self, ctx: &JobContext, args: &[serde_json::Value]) -> JobResult {
        let prompt = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::fatal("predict_text expects one string argument").with_code("BAD_ARGS"))?;

        let model = self.model().await;
        ctx.log_info(&format!("generating with {}", model.name()));
        Ok(serde_json::Value::String(model.generate(prompt)))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

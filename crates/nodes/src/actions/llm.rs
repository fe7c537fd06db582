use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use super::required;
use crate::action::{tags, LlmParams};
use crate::ai::AiTask;
use crate::{ActionContext, ExecutableAction, NodeError, ProviderKind};

#[async_trait]
impl ExecutableAction for LlmParams {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Value, NodeError> {
        let config = &ctx.services.config;
        let credential = ctx.credential()?;
        let api_key = credential.require("apiKey")?;
        let client = ctx
            .services
            .ai
            .as_ref()
            .ok_or_else(|| NodeError::AiTask("no AI worker pool is configured".into()))?;

        let prompt = required("prompt", ctx.resolve(&self.prompt))?;
        let (tag, base_url) = match self.provider {
            ProviderKind::OpenAi => (tags::OPENAI, config.openai_base_url.clone()),
            ProviderKind::OpenRouter => (
                tags::OPENROUTER,
                credential
                    .field("url")
                    .unwrap_or(config.openrouter_base_url.as_str())
                    .to_owned(),
            ),
        };

        let task_id = Uuid::new_v4().to_string();
        let task = AiTask {
            task_id: task_id.clone(),
            prompt,
            model: self.model(),
            temperature: self.temperature(),
            max_tokens: self.max_tokens(),
            api_key: api_key.to_owned(),
            provider: self.provider,
            base_url,
            http_referer: credential.field("httpReferer").map(str::to_owned),
            x_title: credential.field("xTitle").map(str::to_owned),
            timestamp: Utc::now(),
        };

        let result = client.submit(task).await?;
        if !result.success {
            return Err(NodeError::AiTask(
                result.error.unwrap_or_else(|| "AI task failed".into()),
            ));
        }

        Ok(json!({
            "success": true,
            "taskId": task_id,
            "actionType": tag,
            "content": result.content,
            "data": result,
            "completedAt": Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::actions::test_support::Harness;
    use crate::ai::{AiCorrelator, AiTaskClient, AiWorkerPool};
    use crate::dispatcher::ActionServices;
    use crate::mock::MockProvider;
    use crate::{Credential, DispatcherConfig};
    use queue::{Correlator, JobQueue, MemoryQueue};

    fn params(provider: ProviderKind) -> LlmParams {
        LlmParams {
            provider,
            prompt: "Summarize: {{previousNode.content}}".into(),
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    fn wired(provider: Arc<MockProvider>) -> (Harness, Arc<MemoryQueue<AiTask>>) {
        let tasks = Arc::new(MemoryQueue::new());
        let correlator: Arc<AiCorrelator> =
            Arc::new(Correlator::new(tasks.clone() as Arc<dyn JobQueue<AiTask>>));
        let pool = AiWorkerPool::new(correlator.clone(), provider, 2);
        tokio::spawn(async move { pool.run().await });

        let mut harness = Harness::new(DispatcherConfig::default());
        harness.services = Arc::new(
            ActionServices::new(DispatcherConfig::default())
                .with_ai(AiTaskClient::new(correlator, Duration::from_secs(5))),
        );
        (harness, tasks)
    }

    #[tokio::test]
    async fn resolves_prompt_and_applies_provider_defaults() {
        let provider = Arc::new(MockProvider::replying("short summary"));
        let (mut harness, tasks) = wired(provider.clone());
        harness.credential = Some(Credential::new(
            "openrouter",
            json!({ "apiKey": "or-key", "url": "https://proxy.local/v1", "xTitle": "Flows" }),
        ));
        harness.prior = json!({ "previousNode": { "content": "long text" } });

        let out = params(ProviderKind::OpenRouter)
            .execute(&harness.ctx())
            .await
            .unwrap();

        assert_eq!(out["content"], "short summary");
        assert_eq!(out["actionType"], "openRouterNodeType");

        let seen = provider.tasks();
        assert_eq!(seen[0].prompt, "Summarize: long text");
        assert_eq!(seen[0].model, "openai/gpt-5-mini");
        assert_eq!(seen[0].temperature, 0.7);
        assert_eq!(seen[0].max_tokens, 1000);
        assert_eq!(seen[0].base_url, "https://proxy.local/v1");
        assert_eq!(seen[0].x_title.as_deref(), Some("Flows"));
        tasks.close();
    }

    #[tokio::test]
    async fn failure_result_fails_the_node() {
        let (mut harness, tasks) = wired(Arc::new(MockProvider::failing("quota exceeded")));
        harness.credential = Some(Credential::new("openai", json!({ "apiKey": "sk" })));

        let err = params(ProviderKind::OpenAi)
            .execute(&harness.ctx())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("quota exceeded"));
        tasks.close();
    }
}

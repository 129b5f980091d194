// src/ai/mod.rs
//! AI escalation: provider abstraction, response cache + daily limit, and the
//! client the detector and keyword generator talk to.
//!
//! Providers only turn a prompt into text. Prompt building, timeouts,
//! cancellation and response validation live in `AiClient`, so every provider
//! (real, mock, scripted test double) gets identical behavior.

pub mod cache;
pub mod prompt;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ai::mock_mode;
use crate::config::AiConfig;
use crate::model::DetectionInput;

pub use cache::CachingProvider;
pub use prompt::{AiSelection, CategoryRef, GeneratedKeyword, GenerationRequest};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EscalationError {
    #[error("AI escalation is disabled")]
    Disabled,
    #[error("daily AI call limit reached")]
    DailyLimit,
    #[error("AI call timed out")]
    Timeout,
    #[error("AI call cancelled by caller")]
    Cancelled,
    #[error("AI provider error: {0}")]
    Provider(String),
    #[error("invalid AI response: {0}")]
    InvalidResponse(String),
}

impl EscalationError {
    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            EscalationError::Disabled => "disabled",
            EscalationError::DailyLimit => "daily_limit",
            EscalationError::Timeout => "timeout",
            EscalationError::Cancelled => "cancelled",
            EscalationError::Provider(_) => "provider_error",
            EscalationError::InvalidResponse(_) => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    SelectCategory,
    GenerateKeywords,
}

impl Task {
    pub fn as_str(self) -> &'static str {
        match self {
            Task::SelectCategory => "select_category",
            Task::GenerateKeywords => "generate_keywords",
        }
    }
}

/// One prompt for a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub task: Task,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

pub type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, EscalationError>> + Send + 'a>>;

/// Low-level provider: one remote call, raw text back.
pub trait Provider: Send + Sync {
    fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a>;
    fn name(&self) -> &'static str;
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("category-detector/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(4))
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Anthropic Messages API.
pub struct ClaudeProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    pub fn new(api_key: String, model: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            api_key,
            model: model.unwrap_or("claude-3-haiku-20240307").to_string(),
        })
    }
}

impl Provider for ClaudeProvider {
    fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a> {
        Box::pin(async move {
            if self.api_key.is_empty() {
                return Err(EscalationError::Provider("missing CLAUDE_API_KEY".into()));
            }

            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                max_tokens: u32,
                system: &'a str,
                messages: Vec<Msg<'a>>,
            }
            #[derive(Deserialize)]
            struct Resp {
                content: Vec<Block>,
            }
            #[derive(Deserialize)]
            struct Block {
                #[serde(default)]
                text: String,
            }

            let body = Req {
                model: &self.model,
                max_tokens: req.max_tokens,
                system: &req.system,
                messages: vec![Msg {
                    role: "user",
                    content: &req.user,
                }],
            };
            let resp = self
                .http
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await
                .map_err(|e| EscalationError::Provider(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(EscalationError::Provider(format!("status {status}")));
            }
            let parsed: Resp = resp
                .json()
                .await
                .map_err(|e| EscalationError::InvalidResponse(e.to_string()))?;
            let text: String = parsed.content.into_iter().map(|b| b.text).collect();
            if text.trim().is_empty() {
                return Err(EscalationError::InvalidResponse("empty content".into()));
            }
            Ok(text)
        })
    }

    fn name(&self) -> &'static str {
        "claude"
    }
}

/// OpenAI Chat Completions API.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            api_key,
            model: model.unwrap_or("gpt-4o-mini").to_string(),
        })
    }
}

impl Provider for OpenAiProvider {
    fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a> {
        Box::pin(async move {
            if self.api_key.is_empty() {
                return Err(EscalationError::Provider("missing OPENAI_API_KEY".into()));
            }

            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                max_tokens: u32,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: String,
            }

            let body = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: &req.system,
                    },
                    Msg {
                        role: "user",
                        content: &req.user,
                    },
                ],
                temperature: 0.2,
                max_tokens: req.max_tokens,
            };
            let resp = self
                .http
                .post("https://api.openai.com/v1/chat/completions")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| EscalationError::Provider(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(EscalationError::Provider(format!("status {status}")));
            }
            let parsed: Resp = resp
                .json()
                .await
                .map_err(|e| EscalationError::InvalidResponse(e.to_string()))?;
            parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| EscalationError::InvalidResponse("empty choices".into()))
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Always fails with `Disabled`.
pub struct DisabledProvider;

impl Provider for DisabledProvider {
    fn complete<'a>(&'a self, _req: &'a Completion) -> ProviderFuture<'a> {
        Box::pin(async { Err(EscalationError::Disabled) })
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic provider for local runs (`AI_TEST_MODE=mock`): picks the first
/// offered category at 90% and derives keywords from the category name.
#[derive(Debug, Clone, Default)]
pub struct MockProvider;

impl MockProvider {
    fn select(user: &str) -> Result<String, EscalationError> {
        static RE_ID: OnceCell<Regex> = OnceCell::new();
        let re = RE_ID.get_or_init(|| Regex::new(r#""id":\s*(-?\d+)"#).expect("id regex"));
        let id = re
            .captures(user)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| EscalationError::InvalidResponse("no candidates in prompt".into()))?;
        Ok(format!(
            r#"{{"categoryId": {id}, "confidence": 90, "reasoning": "mock selection"}}"#
        ))
    }

    fn keywords(user: &str) -> String {
        let name = user
            .lines()
            .find_map(|l| l.strip_prefix("Category name:"))
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let mut kws: Vec<serde_json::Value> = Vec::new();
        if !name.is_empty() {
            kws.push(serde_json::json!({ "keyword": name, "type": "main", "weight": 1.0 }));
        }
        for word in name.split_whitespace().filter(|w| w.chars().count() >= 3) {
            kws.push(serde_json::json!({ "keyword": word, "type": "synonym", "weight": 0.8 }));
        }
        serde_json::json!({ "keywords": kws }).to_string()
    }
}

impl Provider for MockProvider {
    fn complete<'a>(&'a self, req: &'a Completion) -> ProviderFuture<'a> {
        let out = match req.task {
            Task::SelectCategory => Self::select(&req.user),
            Task::GenerateKeywords => Ok(Self::keywords(&req.user)),
        };
        Box::pin(async move { out })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Factory: build a provider according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns the deterministic mock behind the cache wrapper.
/// * Else if `config.enabled == false`, returns a disabled provider.
/// * Else the real provider wrapped with caching + daily limit.
pub fn build_provider(cfg: &AiConfig) -> Arc<dyn Provider> {
    if mock_mode() {
        return Arc::new(CachingProvider::new(MockProvider, None, cfg.daily_limit));
    }
    if !cfg.enabled {
        return Arc::new(DisabledProvider);
    }

    let built: anyhow::Result<Arc<dyn Provider>> = match cfg.provider.as_str() {
        "claude" | "anthropic" => {
            ClaudeProvider::new(cfg.api_key.clone(), cfg.model.as_deref(), cfg.timeout()).map(
                |p| -> Arc<dyn Provider> {
                    Arc::new(CachingProvider::new(p, cfg.cache_dir.clone(), cfg.daily_limit))
                },
            )
        }
        "openai" => {
            OpenAiProvider::new(cfg.api_key.clone(), cfg.model.as_deref(), cfg.timeout()).map(
                |p| -> Arc<dyn Provider> {
                    Arc::new(CachingProvider::new(p, cfg.cache_dir.clone(), cfg.daily_limit))
                },
            )
        }
        other => Err(anyhow::anyhow!("unsupported provider {other}")),
    };

    match built {
        Ok(p) => p,
        Err(e) => {
            warn!(target: "ai", error = %format!("{e:#}"), "AI provider unavailable, escalation disabled");
            Arc::new(DisabledProvider)
        }
    }
}

/// High-level client: prompt, bounded call, validated answer.
#[derive(Clone)]
pub struct AiClient {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl AiClient {
    pub fn new(provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn from_config(cfg: &AiConfig) -> Self {
        Self::new(build_provider(cfg), cfg.timeout())
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledProvider), Duration::from_secs(1))
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.name() != "disabled"
    }

    async fn call(&self, req: &Completion, cancel: &CancellationToken) -> Result<String, EscalationError> {
        if !self.is_enabled() {
            return Err(EscalationError::Disabled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EscalationError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.provider.complete(req)) => match r {
                Ok(out) => out,
                Err(_) => Err(EscalationError::Timeout),
            },
        }
    }

    /// Ask the model to choose among `candidates`.
    pub async fn select_category(
        &self,
        input: &DetectionInput,
        candidates: &[CategoryRef],
        cancel: &CancellationToken,
    ) -> Result<AiSelection, EscalationError> {
        if candidates.is_empty() {
            return Err(EscalationError::InvalidResponse("no candidates to choose from".into()));
        }
        let req = prompt::selection_prompt(input, candidates);
        let text = self.call(&req, cancel).await?;
        let sel = prompt::parse_selection(&text, candidates)?;
        debug!(
            target: "ai",
            provider = self.provider.name(),
            category_id = %sel.category_id,
            confidence = sel.confidence,
            "selection parsed"
        );
        Ok(sel)
    }

    pub async fn generate_keywords(
        &self,
        req: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedKeyword>, EscalationError> {
        let completion = prompt::generation_prompt(req);
        let text = self.call(&completion, cancel).await?;
        prompt::parse_keywords(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CategoryId;

    struct Slow;

    impl Provider for Slow {
        fn complete<'a>(&'a self, _req: &'a Completion) -> ProviderFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("{}".to_string())
            })
        }
        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn offered() -> Vec<CategoryRef> {
        vec![CategoryRef {
            id: CategoryId(5),
            name: "Laptops".into(),
            slug: "laptops".into(),
        }]
    }

    #[tokio::test]
    async fn mock_picks_first_candidate() {
        let client = AiClient::new(Arc::new(MockProvider), Duration::from_secs(1));
        let sel = client
            .select_category(&DetectionInput::new("ThinkPad", ""), &offered(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sel.category_id, CategoryId(5));
        assert!((sel.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn mock_generates_from_name() {
        let client = AiClient::new(Arc::new(MockProvider), Duration::from_secs(1));
        let req = GenerationRequest {
            category_id: CategoryId(5),
            category_name: "Gaming Laptops".into(),
            category_slug: "gaming-laptops".into(),
            language: "en".into(),
            min_keywords: 10,
        };
        let kws = client
            .generate_keywords(&req, &CancellationToken::new())
            .await
            .unwrap();
        let words: Vec<&str> = kws.iter().map(|k| k.keyword.as_str()).collect();
        assert_eq!(words, vec!["gaming laptops", "gaming", "laptops"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let client = AiClient::new(Arc::new(Slow), Duration::from_millis(50));
        let err = client
            .select_category(&DetectionInput::new("x", ""), &offered(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, EscalationError::Timeout);
    }

    #[tokio::test]
    async fn cancellation_abandons_call() {
        let client = AiClient::new(Arc::new(Slow), Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        let err = client
            .select_category(&DetectionInput::new("x", ""), &offered(), &token)
            .await
            .unwrap_err();
        assert_eq!(err, EscalationError::Cancelled);
    }

    #[tokio::test]
    async fn disabled_client_short_circuits() {
        let err = AiClient::disabled()
            .select_category(&DetectionInput::new("x", ""), &offered(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, EscalationError::Disabled);
    }
}

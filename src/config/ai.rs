// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};

fn default_provider() -> String {
    "claude".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_daily_limit() -> u32 {
    200
}
fn default_timeout_ms() -> u64 {
    8_000
}
fn default_cache_dir() -> Option<PathBuf> {
    Some(PathBuf::from("cache/ai"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "claude" | "openai" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Provider model override; each provider has its own default.
    #[serde(default)]
    pub model: Option<String>,
    /// "ENV" means: read from CLAUDE_API_KEY / OPENAI_API_KEY (by provider)
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Real provider calls per day; cache hits are free.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Upper bound for one escalation call.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// File cache of provider responses. `None` disables the file cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: None,
            api_key: default_api_key(),
            daily_limit: default_daily_limit(),
            timeout_ms: default_timeout_ms(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl AiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Normalize provider and resolve an "ENV" api key. Only an enabled config
    /// with a missing key is an error.
    pub fn resolve(&mut self) -> anyhow::Result<()> {
        // Normalize provider
        self.provider = self.provider.trim().to_lowercase();

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            let var = match self.provider.as_str() {
                "claude" | "anthropic" => "CLAUDE_API_KEY",
                "openai" => "OPENAI_API_KEY",
                other => {
                    if self.enabled {
                        anyhow::bail!("Unsupported provider in config: {other}");
                    }
                    self.api_key.clear();
                    return Ok(());
                }
            };
            match env::var(var) {
                Ok(k) => self.api_key = k,
                Err(_) if self.enabled && !mock_mode() => {
                    anyhow::bail!("Missing {var} env var")
                }
                Err(_) => self.api_key.clear(),
            }
        }
        Ok(())
    }
}

/// `AI_TEST_MODE=mock` swaps the real provider for a deterministic one.
pub fn mock_mode() -> bool {
    env::var("AI_TEST_MODE")
        .map(|v| v.eq_ignore_ascii_case("mock"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_tolerates_missing_key() {
        let mut cfg = AiConfig {
            provider: "  OpenAI ".into(),
            api_key: "env".into(),
            ..Default::default()
        };
        // Whatever the env holds, a disabled config never fails to resolve.
        cfg.resolve().unwrap();
        assert_eq!(cfg.provider, "openai");
    }

    #[test]
    fn literal_key_is_kept() {
        let mut cfg = AiConfig {
            enabled: true,
            api_key: "sk-literal".into(),
            ..Default::default()
        };
        cfg.resolve().unwrap();
        assert_eq!(cfg.api_key, "sk-literal");
        assert_eq!(cfg.timeout(), Duration::from_millis(8_000));
    }
}

//! Tract configuration.
//!
//! One [`TractConfig`] is resolved per tract at open time. It carries the
//! storage path, token budget enforcement, tokenizer selection, compile
//! cache sizing, LLM sampling defaults with per-operation overrides, and
//! the custom content type registry.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::content::TypeRegistry;

/// What to do when a commit would push the tract past its token budget.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    /// Log at warning level and proceed.
    #[default]
    Warn,
    /// Abort the commit with a budget error; no state change.
    Reject,
    /// Invoke the configured callback with (current, max), then proceed.
    Callback,
}

/// Callback invoked by [`BudgetAction::Callback`] with (current, max).
pub type BudgetCallback = Rc<dyn Fn(usize, usize)>;

/// Token budget enforcement for the commit engine.
#[derive(Clone, Default)]
pub struct TokenBudgetConfig {
    pub max_tokens: usize,
    pub action: BudgetAction,
    pub callback: Option<BudgetCallback>,
}

impl TokenBudgetConfig {
    pub fn warn(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            action: BudgetAction::Warn,
            callback: None,
        }
    }

    pub fn reject(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            action: BudgetAction::Reject,
            callback: None,
        }
    }

    pub fn with_callback(max_tokens: usize, callback: BudgetCallback) -> Self {
        Self {
            max_tokens,
            action: BudgetAction::Callback,
            callback: Some(callback),
        }
    }
}

impl std::fmt::Debug for TokenBudgetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgetConfig")
            .field("max_tokens", &self.max_tokens)
            .field("action", &self.action)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// LLM sampling parameters attached to requests and stored per commit.
///
/// Unknown provider-specific parameters ride along in `extra` and are
/// forwarded to the request payload untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl LlmConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<LlmConfig> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Overlay `other` on top of `self`: set fields in `other` win.
    pub fn merged_with(&self, other: &LlmConfig) -> LlmConfig {
        let mut extra = self.extra.clone();
        for (k, v) in &other.extra {
            extra.insert(k.clone(), v.clone());
        }
        LlmConfig {
            model: other.model.clone().or_else(|| self.model.clone()),
            temperature: other.temperature.or(self.temperature),
            max_tokens: other.max_tokens.or(self.max_tokens),
            extra,
        }
    }
}

/// Automatic commit-message generation policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AutoSummarize {
    /// No automatic messages.
    #[default]
    Off,
    /// Use the default LLM client and config.
    On,
    /// Use the default client with this model.
    Model(String),
    /// Use the default client with this full config.
    Config(LlmConfig),
}

impl AutoSummarize {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AutoSummarize::Off)
    }
}

/// Per-tract configuration, resolved at open time.
#[derive(Debug, Clone)]
pub struct TractConfig {
    /// Storage path; `":memory:"` for an ephemeral tract.
    pub path: String,
    /// Identifier; a fresh UUID when absent.
    pub tract_id: Option<String>,
    pub token_budget: Option<TokenBudgetConfig>,
    /// Encoding name for the token counter.
    pub tokenizer_encoding: String,
    /// LRU capacity of the compile snapshot cache.
    pub compile_cache_size: usize,
    pub auto_summarize: AutoSummarize,
    /// Default sampling parameters for LLM requests.
    pub default_config: Option<LlmConfig>,
    /// Per-operation sampling overrides: `chat`, `merge`, `compress`,
    /// `summarize`.
    pub operation_configs: HashMap<String, LlmConfig>,
    /// Compile-time role overrides per content type.
    pub type_roles: HashMap<String, String>,
    /// Custom content type registry consulted before the built-in union.
    pub custom_types: TypeRegistry,
    /// Raise instead of committing while HEAD is detached.
    pub forbid_detached_commits: bool,
}

impl Default for TractConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            tract_id: None,
            token_budget: None,
            tokenizer_encoding: "cl100k_base".to_string(),
            compile_cache_size: 32,
            auto_summarize: AutoSummarize::Off,
            default_config: None,
            operation_configs: HashMap::new(),
            type_roles: HashMap::new(),
            custom_types: TypeRegistry::new(),
            forbid_detached_commits: false,
        }
    }
}

impl TractConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Sampling config for an operation: per-operation override merged
    /// over the default config.
    pub fn config_for(&self, operation: &str) -> LlmConfig {
        match (self.default_config.as_ref(), self.operation_configs.get(operation)) {
            (Some(base), Some(over)) => base.merged_with(over),
            (None, Some(over)) => over.clone(),
            (Some(base), None) => base.clone(),
            (None, None) => LlmConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Operation overrides win over the default config, field by field.
    #[test]
    fn test_config_for_merges_overrides() {
        let mut config = TractConfig::default();
        config.default_config = Some(LlmConfig {
            model: Some("base-model".to_string()),
            temperature: Some(0.7),
            ..Default::default()
        });
        config.operation_configs.insert(
            "compress".to_string(),
            LlmConfig {
                temperature: Some(0.2),
                ..Default::default()
            },
        );

        let resolved = config.config_for("compress");
        assert_eq!(resolved.model.as_deref(), Some("base-model"));
        assert_eq!(resolved.temperature, Some(0.2));

        let chat = config.config_for("chat");
        assert_eq!(chat.temperature, Some(0.7));
    }

    /// Extra params survive serde round trips via the flatten map.
    #[test]
    fn test_llm_config_extra_roundtrip() {
        let value = serde_json::json!({"model": "m", "top_p": 0.9});
        let config = LlmConfig::from_value(&value).expect("parse");
        assert_eq!(config.model.as_deref(), Some("m"));
        assert_eq!(config.extra.get("top_p"), Some(&serde_json::json!(0.9)));
        assert_eq!(config.to_value(), value);
    }
}

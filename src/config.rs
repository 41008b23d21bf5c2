//! Provider configuration
//!
//! [`ProviderConfig`] is immutable once built. Hosts either deserialize it
//! (it derives `serde::Deserialize`) or assemble it with
//! [`ProviderConfig::builder`]. Credentials may be left out and supplied
//! through environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `LLM_RELAY_<KEY>_API_KEY` | `api_key` |
//! | `LLM_RELAY_<KEY>_BASE_URL` | `base_url` |
//! | `LLM_RELAY_<KEY>_MODEL` | `model` |
//! | `LLM_RELAY_<KEY>_FOLDER_ID` | `folder_id` |
//! | `LLM_RELAY_<KEY>_AUTH_KEY` | `oauth.auth_key` |
//!
//! `<KEY>` is the provider key upper-cased with non-alphanumerics replaced by `_`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Supported backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local Ollama server (line-delimited JSON)
    Ollama,
    /// Any OpenAI-compatible chat completions server (LM Studio, llama.cpp, vLLM)
    #[serde(rename = "openai_compatible", alias = "openai")]
    OpenAiCompatible,
    /// YandexGPT foundation models completion API
    YandexGpt,
    /// Yandex AI Studio agent (Responses API with stored prompt)
    YandexAgent,
    /// GigaChat (OAuth2 client credentials)
    #[serde(rename = "gigachat", alias = "giga_chat")]
    GigaChat,
}

impl BackendKind {
    /// Get the default base URL for this backend
    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "http://localhost:11434",
            BackendKind::OpenAiCompatible => "http://localhost:1234/v1",
            BackendKind::YandexGpt => "https://llm.api.cloud.yandex.net/foundationModels/v1",
            BackendKind::YandexAgent => "https://rest-assistant.api.cloud.yandex.net/v1",
            BackendKind::GigaChat => "https://gigachat.devices.sberbank.ru/api/v1",
        }
    }

    /// Parse a backend kind from a string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ollama" | "local" => Some(BackendKind::Ollama),
            "openai" | "openai_compatible" | "openai-compatible" | "lmstudio" | "llamacpp"
            | "llama.cpp" | "vllm" => Some(BackendKind::OpenAiCompatible),
            "yandex" | "yandexgpt" | "yandex_gpt" | "yandex-gpt" => Some(BackendKind::YandexGpt),
            "yandex_agent" | "yandex-agent" | "yandexagent" => Some(BackendKind::YandexAgent),
            "gigachat" | "giga_chat" | "giga-chat" => Some(BackendKind::GigaChat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAiCompatible => "openai_compatible",
            BackendKind::YandexGpt => "yandex_gpt",
            BackendKind::YandexAgent => "yandex_agent",
            BackendKind::GigaChat => "gigachat",
        }
    }
}

/// OAuth2 client-credentials settings (GigaChat).
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthSettings {
    /// Base64 `client_id:client_secret` pair sent as `Authorization: Basic`.
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default = "default_oauth_scope")]
    pub scope: String,
    #[serde(default = "default_oauth_url")]
    pub auth_url: String,
}

fn default_oauth_scope() -> String {
    "GIGACHAT_API_PERS".to_string()
}

fn default_oauth_url() -> String {
    "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".to_string()
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            auth_key: None,
            scope: default_oauth_scope(),
            auth_url: default_oauth_url(),
        }
    }
}

impl std::fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("auth_key", &self.auth_key.as_ref().map(|_| "***"))
            .field("scope", &self.scope)
            .field("auth_url", &self.auth_url)
            .finish()
    }
}

/// Configuration of one provider entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub key: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Short-lived IAM bearer token, used instead of `api_key` when present.
    #[serde(default)]
    pub iam_token: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub oauth: Option<OAuthSettings>,
    /// Stored prompt id for agent backends.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Default variables for the stored prompt; per-call variables win.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Ask reasoning-capable models to think before answering.
    #[serde(default)]
    pub reasoning: bool,
    /// Some local models reject the `tools` field; disable to force text recovery.
    #[serde(default = "default_true")]
    pub native_tools: bool,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_temperature() -> f32 {
    0.3
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("iam_token", &self.iam_token.as_ref().map(|_| "***"))
            .field("folder_id", &self.folder_id)
            .field("oauth", &self.oauth)
            .field("agent_id", &self.agent_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("reasoning", &self.reasoning)
            .field("native_tools", &self.native_tools)
            .finish()
    }
}

impl ProviderConfig {
    /// Create a new builder for ProviderConfig
    pub fn builder(key: impl Into<String>, kind: BackendKind) -> ProviderConfigBuilder {
        ProviderConfigBuilder::new(key, kind)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base URL with the kind default applied and trailing slashes removed.
    pub fn endpoint(&self) -> String {
        let base = if self.base_url.trim().is_empty() {
            self.kind.default_base_url()
        } else {
            self.base_url.trim()
        };
        base.trim_end_matches('/').to_string()
    }

    /// Return the value or a `Config` error naming the missing field.
    pub(crate) fn require<'a>(&self, value: Option<&'a str>, field: &str) -> Result<&'a str> {
        match value {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(Error::config(format!(
                "{} is required for provider '{}' ({})",
                field,
                self.key,
                self.kind.as_str()
            ))),
        }
    }

    /// Apply `LLM_RELAY_<KEY>_*` environment variables to unset fields.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup; used by `with_env_overrides`.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let prefix = env_prefix(&self.key);
        let get = |field: &str| lookup(&format!("{prefix}_{field}")).filter(|v| !v.is_empty());

        if self.api_key.is_none() {
            self.api_key = get("API_KEY");
        }
        if let Some(url) = get("BASE_URL") {
            self.base_url = url;
        }
        if self.model.is_empty() {
            if let Some(model) = get("MODEL") {
                self.model = model;
            }
        }
        if self.folder_id.is_none() {
            self.folder_id = get("FOLDER_ID");
        }
        if let Some(auth_key) = get("AUTH_KEY") {
            let oauth = self.oauth.get_or_insert_with(OAuthSettings::default);
            if oauth.auth_key.is_none() {
                oauth.auth_key = Some(auth_key);
            }
        }
        self
    }
}

fn env_prefix(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("LLM_RELAY_{normalized}")
}

/// Builder for ProviderConfig
#[derive(Debug)]
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
}

impl ProviderConfigBuilder {
    fn new(key: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            config: ProviderConfig {
                key: key.into(),
                kind,
                model: String::new(),
                base_url: String::new(),
                api_key: None,
                iam_token: None,
                folder_id: None,
                oauth: None,
                agent_id: None,
                variables: BTreeMap::new(),
                timeout_secs: default_timeout_secs(),
                temperature: default_temperature(),
                max_tokens: None,
                reasoning: false,
                native_tools: true,
            },
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn iam_token(mut self, token: impl Into<String>) -> Self {
        self.config.iam_token = Some(token.into());
        self
    }

    pub fn folder_id(mut self, folder: impl Into<String>) -> Self {
        self.config.folder_id = Some(folder.into());
        self
    }

    pub fn oauth(mut self, settings: OAuthSettings) -> Self {
        self.config.oauth = Some(settings);
        self
    }

    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.config.agent_id = Some(id.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.variables.insert(name.into(), value.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = Some(tokens);
        self
    }

    pub fn reasoning(mut self, enabled: bool) -> Self {
        self.config.reasoning = enabled;
        self
    }

    pub fn native_tools(mut self, enabled: bool) -> Self {
        self.config.native_tools = enabled;
        self
    }

    pub fn build(self) -> Result<ProviderConfig> {
        let config = self.config;
        if config.key.trim().is_empty() {
            return Err(Error::config("provider key is required"));
        }
        if config.model.trim().is_empty() && config.kind != BackendKind::YandexAgent {
            return Err(Error::config(format!(
                "model is required for provider '{}'",
                config.key
            )));
        }
        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(Error::config(format!(
                "temperature {} is outside 0.0..=2.0",
                config.temperature
            )));
        }
        if config.timeout_secs == 0 {
            return Err(Error::config("timeout_secs must be positive"));
        }
        Ok(config)
    }
}

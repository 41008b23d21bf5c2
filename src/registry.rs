//! Provider registry
//!
//! Maps logical [`Operation`]s to configured provider keys and builds each
//! adapter on first use. Adapters are cached and shared: continuation state
//! lives in the caller's [`Conversation`](crate::session::Conversation), so one
//! instance serves any number of conversations.
//!
//! ```rust
//! use llm_relay::{BackendKind, Operation, ProviderConfig, ProviderRegistry};
//!
//! let local = ProviderConfig::builder("local", BackendKind::Ollama)
//!     .model("qwen3:8b")
//!     .build()
//!     .unwrap();
//! let registry = ProviderRegistry::new()
//!     .with_provider(local)
//!     .route(Operation::Classification, "local");
//!
//! let provider = registry.for_operation(&Operation::Classification).unwrap();
//! assert_eq!(provider.key(), "local");
//! ```

use crate::config::ProviderConfig;
use crate::providers::{Provider, build_provider};
use crate::types::Operation;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ProviderRegistry {
    configs: HashMap<String, ProviderConfig>,
    routes: HashMap<Operation, String>,
    default_key: Option<String>,
    instances: Mutex<HashMap<String, Arc<dyn Provider>>>,
    http: reqwest::Client,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::with_http_client(reqwest::Client::new())
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots) for every adapter.
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self {
            configs: HashMap::new(),
            routes: HashMap::new(),
            default_key: None,
            instances: Mutex::new(HashMap::new()),
            http,
        }
    }

    /// Add a provider entry. The first one added becomes the default.
    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        self.add_provider(config);
        self
    }

    pub fn add_provider(&mut self, config: ProviderConfig) {
        if self.default_key.is_none() {
            self.default_key = Some(config.key.clone());
        }
        // A changed config must not keep serving the old adapter.
        self.instances.lock().remove(&config.key);
        self.configs.insert(config.key.clone(), config);
    }

    /// Route `operation` to the provider registered under `key`.
    pub fn route(mut self, operation: impl Into<Operation>, key: impl Into<String>) -> Self {
        self.routes.insert(operation.into(), key.into());
        self
    }

    pub fn with_default(mut self, key: impl Into<String>) -> Self {
        self.default_key = Some(key.into());
        self
    }

    /// Register a ready-made adapter under its own key.
    pub fn register_instance(&self, provider: Arc<dyn Provider>) {
        debug!(provider = %provider.key(), "Registering provider instance");
        self.instances.lock().insert(provider.key().to_string(), provider);
    }

    /// Provider key an operation resolves to.
    pub fn key_for(&self, operation: &Operation) -> Result<&str> {
        self.routes
            .get(operation)
            .or(self.default_key.as_ref())
            .map(String::as_str)
            .ok_or_else(|| {
                Error::config(format!(
                    "no provider configured for operation '{operation}' and no default"
                ))
            })
    }

    pub fn for_operation(&self, operation: &Operation) -> Result<Arc<dyn Provider>> {
        let key = self.key_for(operation)?.to_string();
        self.get(&key)
    }

    /// Adapter for `key`, built and cached on first use.
    pub fn get(&self, key: &str) -> Result<Arc<dyn Provider>> {
        let mut instances = self.instances.lock();
        if let Some(provider) = instances.get(key) {
            return Ok(provider.clone());
        }
        let config = self
            .configs
            .get(key)
            .ok_or_else(|| Error::config(format!("unknown provider '{key}'")))?;

        info!(
            provider = %config.key,
            kind = config.kind.as_str(),
            model = %config.model,
            "Instantiating provider"
        );
        let provider = build_provider(config.clone(), self.http.clone());
        instances.insert(key.to_string(), provider.clone());
        Ok(provider)
    }

    pub fn config(&self, key: &str) -> Option<&ProviderConfig> {
        self.configs.get(key)
    }

    /// Keys of every configured or registered provider, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.configs.keys().cloned().collect();
        for key in self.instances.lock().keys() {
            if !self.configs.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.keys())
            .field("routes", &self.routes)
            .field("default_key", &self.default_key)
            .finish()
    }
}

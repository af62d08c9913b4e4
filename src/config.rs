//! Secure configuration loading with memory-safe environment variable handling.
//!
//! Generalizes the gateway configuration away from a fixed provider enum:
//! any schema-registered provider name can supply an API key via
//! `<PROVIDER>_API_KEY`, sourced through `secrecy::Secret<String>` so keys
//! never appear in `Debug` output or logs and are zeroized on drop.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::Secret;
use tracing::{debug, warn};

use crate::context::ContextConfig;

/// Secure environment variable loader with automatic cleanup.
pub struct EnvLoader {
    /// Cached environment variables (zeroized on drop via `Secret`).
    env_cache: HashMap<String, Secret<String>>,
}

/// General, non-provider-specific knobs read from the environment.
const GENERAL_VARS: &[&str] = &[
    "LLM_PROVIDER",
    "LLM_SCHEMA_DIR",
    "LLM_TIMEOUT",
    "LLM_DEBUG",
    "LLM_MAX_TOKENS",
    "LLM_TEMPERATURE",
];

impl EnvLoader {
    /// Load every general knob plus every `*_API_KEY` variable currently set
    /// in the process environment into a secure cache.
    pub fn new() -> Self {
        let mut env_cache = HashMap::new();

        for name in GENERAL_VARS {
            if let Ok(value) = env::var(name) {
                env_cache.insert(name.to_string(), Secret::new(value));
            }
        }
        for (key, value) in env::vars() {
            if key.ends_with("_API_KEY") {
                env_cache.insert(key, Secret::new(value));
            }
        }

        debug!("loaded {} environment variables into secure cache", env_cache.len());
        Self { env_cache }
    }

    /// Get a non-sensitive configuration value.
    pub fn get_public(&self, key: &str) -> Option<String> {
        use secrecy::ExposeSecret;
        self.env_cache.get(key).map(|secret| secret.expose_secret().clone())
    }

    /// Parse a numeric environment variable with a default.
    pub fn get_numeric<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Copy,
        T::Err: std::fmt::Display,
    {
        self.get_public(key)
            .and_then(|value| {
                value
                    .parse()
                    .map_err(|e| {
                        warn!("failed to parse {key} as numeric: {e}");
                        e
                    })
                    .ok()
            })
            .unwrap_or(default)
    }

    /// Parse a boolean environment variable with a default.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_public(key)
            .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }

    /// Every `<PROVIDER>_API_KEY` variable cached, keyed by the lower-cased
    /// provider name.
    pub fn api_keys(&self) -> HashMap<String, Secret<String>> {
        use secrecy::ExposeSecret;
        let mut out = HashMap::new();
        for (key, secret) in &self.env_cache {
            if let Some(prefix) = key.strip_suffix("_API_KEY") {
                out.insert(prefix.to_lowercase(), Secret::new(secret.expose_secret().clone()));
            }
        }
        out
    }
}

impl Drop for EnvLoader {
    fn drop(&mut self) {
        for (key, secret) in self.env_cache.drain() {
            debug!("clearing cached environment variable: {key}");
            drop(secret);
        }
        debug!("environment variable cache cleared");
    }
}

/// API keys for every provider that had a `<PROVIDER>_API_KEY` environment
/// variable set, keyed by lower-cased provider name.
#[derive(Debug, Default)]
pub struct ApiKeyStore(HashMap<String, Secret<String>>);

impl ApiKeyStore {
    /// Look up the stored key for `provider`, if any.
    pub fn get(&self, provider: &str) -> Option<&Secret<String>> {
        self.0.get(provider)
    }

    /// Store (or overwrite) a key for `provider`.
    pub fn set(&mut self, provider: impl Into<String>, key: impl Into<String>) {
        self.0.insert(provider.into(), Secret::new(key.into()));
    }
}

/// Gateway-wide configuration: which provider to default to, where to find
/// bundled/custom schema files, and the ambient knobs (timeout, default
/// parameter overlays) threaded into every [`ContextConfig`] and
/// [`crate::sink::ReqwestSink`] this process builds.
#[derive(Debug)]
pub struct GatewayConfig {
    default_provider: String,
    schema_directory: Option<PathBuf>,
    timeout_seconds: u64,
    debug_mode: bool,
    default_max_tokens: Option<u64>,
    default_temperature: Option<f64>,
    api_keys: ApiKeyStore,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    ///
    /// ## Environment variables
    /// - `LLM_PROVIDER` - default provider name (default: `"openai"`)
    /// - `LLM_SCHEMA_DIR` - directory of additional schema JSON files
    /// - `LLM_TIMEOUT` - request timeout in seconds (default: 60)
    /// - `LLM_DEBUG` - enable debug mode: `"true"`/`"false"` (default: false)
    /// - `LLM_MAX_TOKENS` / `LLM_TEMPERATURE` - default parameter overlays
    /// - `<PROVIDER>_API_KEY` - API key for any provider name, e.g. `OPENAI_API_KEY`
    pub fn from_env() -> Self {
        Self::from_env_loader(EnvLoader::new())
    }

    /// Load configuration from an already-constructed [`EnvLoader`] — used
    /// directly by tests that want to avoid touching the real environment.
    pub fn from_env_loader(loader: EnvLoader) -> Self {
        let default_provider = loader.get_public("LLM_PROVIDER").unwrap_or_else(|| "openai".to_string());
        let schema_directory = loader.get_public("LLM_SCHEMA_DIR").map(PathBuf::from);
        let timeout_seconds = loader.get_numeric("LLM_TIMEOUT", 60u64);
        let debug_mode = loader.get_bool("LLM_DEBUG", false);
        let default_max_tokens = loader.get_public("LLM_MAX_TOKENS").and_then(|v| v.parse().ok());
        let default_temperature = loader.get_public("LLM_TEMPERATURE").and_then(|v| v.parse().ok());

        if debug_mode {
            warn!("debug mode enabled - be careful with sensitive data in logs!");
        }

        Self {
            default_provider,
            schema_directory,
            timeout_seconds,
            debug_mode,
            default_max_tokens,
            default_temperature,
            api_keys: ApiKeyStore(loader.api_keys()),
        }
    }

    /// The provider name to use when none is specified explicitly.
    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Directory of additional schema files, if `LLM_SCHEMA_DIR` was set.
    pub fn schema_directory(&self) -> Option<&Path> {
        self.schema_directory.as_deref()
    }

    /// Request timeout, applied to every [`crate::sink::ReqwestSink`] built
    /// from this configuration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Whether debug mode is enabled.
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// The API key cached for `provider`, if its `<PROVIDER>_API_KEY`
    /// environment variable was set.
    pub fn api_key_for(&self, provider: &str) -> Option<&Secret<String>> {
        self.api_keys.get(provider)
    }

    /// Register or overwrite the API key for `provider` at runtime.
    pub fn set_api_key(&mut self, provider: impl Into<String>, key: impl Into<String>) {
        self.api_keys.set(provider, key);
    }

    /// Build the [`ContextConfig`] this gateway configuration implies:
    /// validation on, streaming support on, and the default parameter
    /// overlays read from the environment.
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            default_max_tokens: self.default_max_tokens,
            default_temperature: self.default_temperature,
            ..ContextConfig::default()
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            schema_directory: None,
            timeout_seconds: 60,
            debug_mode: false,
            default_max_tokens: None,
            default_temperature: None,
            api_keys: ApiKeyStore::default(),
        }
    }
}

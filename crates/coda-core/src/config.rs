//! Provider configuration: `~/.coda/providers.json` plus environment overrides.
//!
//! The file holds a list of OpenAI-compatible providers and which one is
//! active. `CODA_BASE_URL` / `CODA_MODEL` override the active provider's
//! endpoint and model; `CODA_API_KEY` overrides whatever key the store holds.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_API_KEY: &str = "CODA_API_KEY";
pub const ENV_BASE_URL: &str = "CODA_BASE_URL";
pub const ENV_MODEL: &str = "CODA_MODEL";

/// One OpenAI-compatible API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub default_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub active_provider: String,
    pub providers: Vec<ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            active_provider: "openai".to_string(),
            providers: vec![ProviderConfig {
                name: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                default_model: "gpt-4o".to_string(),
            }],
        }
    }
}

/// Per-app data directory (`~/.coda`), created on demand.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let dir = home.join(".coda");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Default database location (`~/.coda/data.db`).
pub fn default_db_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("data.db"))
}

/// Key file backing the at-rest secret cipher.
pub fn key_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(".enc_key"))
}

fn providers_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("providers.json"))
}

impl AppConfig {
    /// Load `providers.json`, falling back to the built-in default when the
    /// file is missing. A malformed file is an error, not a silent reset.
    pub fn load() -> Result<Self> {
        let path = providers_file()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no providers file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid provider config in {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = providers_file()?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// The provider the session should talk to, with env overrides applied.
    pub fn resolve_active(&self, override_name: Option<&str>) -> Result<ProviderConfig> {
        let name = override_name.unwrap_or(&self.active_provider);
        let mut provider = self
            .provider(name)
            .cloned()
            .with_context(|| format!("provider '{}' is not configured", name))?;
        if let Ok(base_url) = std::env::var(ENV_BASE_URL) {
            if !base_url.trim().is_empty() {
                provider.base_url = base_url.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var(ENV_MODEL) {
            if !model.trim().is_empty() {
                provider.default_model = model.trim().to_string();
            }
        }
        Ok(provider)
    }
}

/// API key from the environment, if set. The store-backed key is the fallback.
pub fn api_key_from_env() -> Option<String> {
    std::env::var(ENV_API_KEY)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_openai_provider() {
        let config = AppConfig::default();
        let provider = config.resolve_active(None).unwrap();
        assert_eq!(provider.name, "openai");
        assert!(provider.base_url.starts_with("https://"));
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let config = AppConfig::default();
        assert!(config.resolve_active(Some("nope")).is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let config = AppConfig {
            active_provider: "local".to_string(),
            providers: vec![ProviderConfig {
                name: "local".to_string(),
                base_url: "http://localhost:8080/v1".to_string(),
                default_model: "qwen2.5".to_string(),
            }],
        };
        let raw = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.active_provider, "local");
        assert_eq!(back.providers[0].default_model, "qwen2.5");
    }
}

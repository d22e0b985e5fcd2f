//! Per-user LLM settings
//!
//! Provider credentials, default model selection, web-search config, and
//! the optimization toggles. Records live as JSON documents in SQLite and
//! are provisioned by whatever deployment layer manages credentials; the
//! database file itself is created owner-only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::storage::{Database, Result};

/// Providers that run on the user's machine and need a reachability
/// preflight instead of an API key.
pub const LOCAL_PROVIDERS: &[&str] = &["lmstudio", "ollama"];

/// Configuration for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Whether this provider may be used
    pub enabled: bool,
    /// API key (cloud providers)
    pub api_key: Option<String>,
    /// Base URL override (local providers)
    pub base_url: Option<String>,
    /// Models the user has enabled
    pub available_models: Vec<String>,
    /// Default model for this provider
    pub default_model: Option<String>,
}

/// Brave Search configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BraveSearchSettings {
    /// Whether web search may run
    pub enabled: bool,
    /// Brave API key
    pub api_key: Option<String>,
}

/// Pipeline tuning toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationSettings {
    /// Run the LLM-as-judge validation pass after each response
    pub response_validation: bool,
    /// Conversation tail length (None = default 25)
    pub history_limit: Option<usize>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            response_validation: false,
            history_limit: None,
        }
    }
}

/// One user's LLM settings record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    /// provider name -> settings
    pub providers: HashMap<String, ProviderSettings>,
    /// Which provider to use
    pub default_provider: Option<String>,
    /// Which model to use
    pub default_model: Option<String>,
    /// Web search config
    pub brave_search: BraveSearchSettings,
    /// Pipeline toggles
    pub optimization: OptimizationSettings,
}

impl LlmSettings {
    /// Settings for the active provider, if one is configured.
    pub fn active_provider(&self) -> Option<(&str, &ProviderSettings)> {
        let name = self.default_provider.as_deref()?;
        self.providers
            .get(name)
            .filter(|p| p.enabled)
            .map(|p| (name, p))
    }

    /// Whether the active provider is a local server needing a preflight.
    pub fn uses_local_provider(&self) -> bool {
        self.default_provider
            .as_deref()
            .is_some_and(|p| LOCAL_PROVIDERS.contains(&p))
    }

    /// Whether web search is fully configured.
    pub fn web_search_configured(&self) -> bool {
        self.brave_search.enabled && self.brave_search.api_key.is_some()
    }
}

/// SQLite-backed settings store.
#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    /// Create the store.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load a user's settings; absent records read as defaults.
    pub fn get(&self, user_id: &str) -> Result<LlmSettings> {
        let raw: Option<String> = self.db.read(|conn| {
            conn.query_row(
                "SELECT settings FROM llm_settings WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(raw
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default())
    }

    /// Save a user's settings.
    pub fn set(&self, user_id: &str, settings: &LlmSettings) -> Result<()> {
        let json = serde_json::to_string(settings)
            .map_err(|e| crate::storage::StorageError::Init(e.to_string()))?;
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO llm_settings (user_id, settings, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                   settings = excluded.settings,
                   updated_at = excluded.updated_at",
                params![user_id, json, Utc::now()],
            )
            .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::scratch_db;

    #[test]
    fn test_defaults_for_missing_user() {
        let (db, _dir) = scratch_db();
        let store = SettingsStore::new(db);
        let settings = store.get("nobody").unwrap();
        assert!(settings.providers.is_empty());
        assert!(!settings.web_search_configured());
        assert!(settings.active_provider().is_none());
    }

    #[test]
    fn test_roundtrip() {
        let (db, _dir) = scratch_db();
        let store = SettingsStore::new(db);

        let mut settings = LlmSettings::default();
        settings.providers.insert(
            "lmstudio".to_string(),
            ProviderSettings {
                enabled: true,
                api_key: None,
                base_url: Some("http://localhost:1234/v1".to_string()),
                available_models: vec!["local-model".to_string()],
                default_model: Some("local-model".to_string()),
            },
        );
        settings.default_provider = Some("lmstudio".to_string());
        settings.default_model = Some("local-model".to_string());
        store.set("u1", &settings).unwrap();

        let loaded = store.get("u1").unwrap();
        let (name, provider) = loaded.active_provider().unwrap();
        assert_eq!(name, "lmstudio");
        assert_eq!(provider.base_url.as_deref(), Some("http://localhost:1234/v1"));
        assert!(loaded.uses_local_provider());
    }

    #[test]
    fn test_disabled_provider_not_active() {
        let (db, _dir) = scratch_db();
        let store = SettingsStore::new(db);
        let mut settings = LlmSettings::default();
        settings
            .providers
            .insert("openai".to_string(), ProviderSettings::default());
        settings.default_provider = Some("openai".to_string());
        store.set("u1", &settings).unwrap();
        assert!(store.get("u1").unwrap().active_provider().is_none());
    }
}

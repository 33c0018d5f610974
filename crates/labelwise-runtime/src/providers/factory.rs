//! Backend factory pattern for building judge backends from configuration.
//!
//! A judge's `backend` block names a provider; the registry finds the
//! matching factory and hands it the remaining settings.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = BackendRegistry::new();
//! registry.register(Arc::new(OpenAiBackendFactory));
//!
//! let backend = registry.create("openai", &json!({"model": "gpt-4o-mini"}))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{BackendError, JudgeBackend};

/// Factory for creating judge backends from configuration.
pub trait BackendFactory: Send + Sync {
    /// Provider name matched against `backend.provider` (e.g., "openai").
    fn provider_type(&self) -> &'static str;

    /// Create a backend instance from provider-specific settings.
    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn JudgeBackend>, BackendError>;

    /// Validate settings without creating a backend.
    fn validate_config(&self, settings: &JsonValue) -> Result<(), BackendError>;

    /// Defaults for optional settings.
    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "Judge backend"
    }
}

/// Registry of available backend factories, keyed by provider name.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any factory with the same provider name.
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Create a backend from provider name and settings.
    pub fn create(
        &self,
        provider_type: &str,
        settings: &JsonValue,
    ) -> Result<Arc<dyn JudgeBackend>, BackendError> {
        self.factory(provider_type)?.create(settings)
    }

    /// Validate settings for a provider.
    pub fn validate(&self, provider_type: &str, settings: &JsonValue) -> Result<(), BackendError> {
        self.factory(provider_type)?.validate_config(settings)
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn BackendFactory>, BackendError> {
        self.factories.get(provider_type).ok_or_else(|| {
            BackendError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    /// Registry with every built-in backend compiled into this build.
    #[cfg(feature = "openai")]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::OpenAiBackendFactory));
        registry
    }

    /// Registry with every built-in backend compiled into this build.
    #[cfg(not(feature = "openai"))]
    pub fn with_defaults() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    struct ScriptedFactory;

    impl BackendFactory for ScriptedFactory {
        fn provider_type(&self) -> &'static str {
            "scripted"
        }

        fn create(&self, settings: &JsonValue) -> Result<Arc<dyn JudgeBackend>, BackendError> {
            self.validate_config(settings)?;
            let name = settings["name"].as_str().unwrap_or("scripted");
            Ok(Arc::new(ScriptedBackend::always_logprobs(name, "1", -2.0, -0.1)))
        }

        fn validate_config(&self, settings: &JsonValue) -> Result<(), BackendError> {
            match settings.get("name") {
                Some(name) if !name.is_string() => Err(BackendError::NotConfigured(
                    "name must be a string".to_string(),
                )),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_registry_register_and_create() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(ScriptedFactory));

        assert!(registry.has_provider("scripted"));
        assert!(!registry.has_provider("unknown"));

        let backend = registry
            .create("scripted", &serde_json::json!({"name": "judge-a"}))
            .unwrap();
        assert_eq!(backend.name(), "judge-a");
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = BackendRegistry::new();
        match registry.create("unknown", &serde_json::json!({})) {
            Err(BackendError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type"));
            }
            _ => panic!("Expected NotConfigured error"),
        }
    }

    #[test]
    fn test_registry_validate() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(ScriptedFactory));

        assert!(registry.validate("scripted", &serde_json::json!({})).is_ok());
        assert!(registry
            .validate("scripted", &serde_json::json!({"name": 3}))
            .is_err());
        assert!(registry.validate("unknown", &serde_json::json!({})).is_err());
        assert_eq!(registry.available_types(), vec!["scripted"]);
    }
}

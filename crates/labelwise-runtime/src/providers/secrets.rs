//! Credential handling for judge backends.
//!
//! API keys are wrapped in [`secrecy::SecretString`] the moment they are
//! read. `Debug` and `Display` print `[REDACTED]`; the raw value is only
//! reachable through [`ApiCredential::expose`] at the point of use.
//!
//! ## Usage
//!
//! ```ignore
//! // `api_key` in the backend settings, else the env var named by
//! // `api_key_env`, else OPENAI_API_KEY
//! let cred = ApiCredential::from_settings(&settings, "OPENAI_API_KEY", "OpenAI API key")?;
//! request.bearer_auth(cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::BackendError;

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `api_key` in the backend settings
    Config,
    /// Environment variable
    Environment,
    /// Passed in by code
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A securely-stored API credential.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    /// Load from an environment variable.
    pub fn from_env(env_var: &str, name: &'static str) -> Result<Self, BackendError> {
        match std::env::var(env_var) {
            Ok(value) if !value.is_empty() => {
                Ok(Self::new(value, CredentialSource::Environment, name))
            }
            _ => Err(BackendError::NotConfigured(format!(
                "{} not set: configure '{}' environment variable",
                name, env_var
            ))),
        }
    }

    /// Load from backend settings.
    ///
    /// Lookup order: `api_key`, then the variable named by `api_key_env`,
    /// then `default_env`.
    pub fn from_settings(
        settings: &JsonValue,
        default_env: &str,
        name: &'static str,
    ) -> Result<Self, BackendError> {
        if let Some(value) = settings["api_key"].as_str() {
            return Ok(Self::new(value, CredentialSource::Config, name));
        }

        let env_var = settings["api_key_env"].as_str().unwrap_or(default_env);
        Self::from_env(env_var, name).map_err(|_| {
            BackendError::NotConfigured(format!(
                "{} required: set 'api_key' in backend settings or the {} environment variable",
                name, env_var
            ))
        })
    }

    /// Whether `from_settings` would succeed, without loading the value.
    pub fn is_available(settings: &JsonValue, default_env: &str) -> bool {
        if settings["api_key"].as_str().is_some() {
            return true;
        }
        let env_var = settings["api_key_env"].as_str().unwrap_or(default_env);
        std::env::var(env_var).is_ok_and(|v| !v.is_empty())
    }

    /// The raw value. Call only where the key is sent; never store the result.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_redacted() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Config, "Test API key");

        let debug = format!("{:?}", cred);
        assert!(!debug.contains(secret), "Secret exposed in Debug!");
        assert!(debug.contains("[REDACTED]"));

        let display = format!("{}", cred);
        assert!(!display.contains(secret), "Secret exposed in Display!");
        assert!(display.contains("Test API key"));
        assert!(display.contains("config"));

        assert_eq!(cred.expose(), secret);
    }

    #[test]
    fn test_settings_key_wins() {
        std::env::set_var("LABELWISE_TEST_KEY_PRIORITY", "env-key");
        let settings = serde_json::json!({
            "api_key": "config-key",
            "api_key_env": "LABELWISE_TEST_KEY_PRIORITY"
        });

        let cred = ApiCredential::from_settings(&settings, "UNUSED", "Test key").unwrap();
        assert_eq!(cred.expose(), "config-key");
        assert_eq!(cred.source(), CredentialSource::Config);

        std::env::remove_var("LABELWISE_TEST_KEY_PRIORITY");
    }

    #[test]
    fn test_named_env_var() {
        std::env::set_var("LABELWISE_TEST_KEY_NAMED", "named-key");
        let settings = serde_json::json!({ "api_key_env": "LABELWISE_TEST_KEY_NAMED" });

        let cred = ApiCredential::from_settings(&settings, "UNUSED", "Test key").unwrap();
        assert_eq!(cred.expose(), "named-key");
        assert_eq!(cred.source(), CredentialSource::Environment);
        assert!(ApiCredential::is_available(&settings, "UNUSED"));

        std::env::remove_var("LABELWISE_TEST_KEY_NAMED");
    }

    #[test]
    fn test_missing_credential_names_the_variable() {
        let settings = serde_json::json!({});
        let err = ApiCredential::from_settings(&settings, "LABELWISE_NONEXISTENT_12345", "Test key")
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Test key"));
        assert!(message.contains("LABELWISE_NONEXISTENT_12345"));
        assert!(!ApiCredential::is_available(
            &settings,
            "LABELWISE_NONEXISTENT_12345"
        ));
    }
}

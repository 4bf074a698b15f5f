use tracing::Level;
use voice_realtime::signaling::{AgentSelector, DEFAULT_ENDPOINT_PREFIX};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub broker_url: String,
    pub endpoint_prefix: String,
    pub agent: AgentSelector,
    pub secondary_agent_id: Option<String>,
    pub user_name: String,
    pub first_message: Option<String>,
    pub language: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let broker_url = std::env::var("BROKER_URL")
            .map_err(|_| ConfigError::MissingVar("BROKER_URL".to_string()))?;

        let endpoint_prefix = std::env::var("ENDPOINT_PREFIX")
            .unwrap_or_else(|_| DEFAULT_ENDPOINT_PREFIX.to_string());

        let agent_str = std::env::var("VOICE_AGENT").unwrap_or_else(|_| "primary".to_string());
        let agent = match agent_str.to_lowercase().as_str() {
            "secondary" => AgentSelector::Secondary,
            "primary" => AgentSelector::Primary,
            other => {
                return Err(ConfigError::InvalidValue(
                    "VOICE_AGENT".to_string(),
                    format!("'{}' is not 'primary' or 'secondary'", other),
                ));
            }
        };

        let secondary_agent_id = std::env::var("SECONDARY_AGENT_ID").ok();
        if agent == AgentSelector::Secondary && secondary_agent_id.is_none() {
            return Err(ConfigError::MissingVar("SECONDARY_AGENT_ID".to_string()));
        }

        let user_name = std::env::var("USER_NAME").unwrap_or_else(|_| "Guest".to_string());
        let first_message = std::env::var("FIRST_MESSAGE").ok();
        let language = std::env::var("LANGUAGE").ok();

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            broker_url,
            endpoint_prefix,
            agent,
            secondary_agent_id,
            user_name,
            first_message,
            language,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("BROKER_URL");
            env::remove_var("ENDPOINT_PREFIX");
            env::remove_var("VOICE_AGENT");
            env::remove_var("SECONDARY_AGENT_ID");
            env::remove_var("USER_NAME");
            env::remove_var("FIRST_MESSAGE");
            env::remove_var("LANGUAGE");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        unsafe {
            env::set_var("BROKER_URL", "https://broker.test");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.broker_url, "https://broker.test");
        assert_eq!(config.endpoint_prefix, DEFAULT_ENDPOINT_PREFIX);
        assert_eq!(config.agent, AgentSelector::Primary);
        assert_eq!(config.secondary_agent_id, None);
        assert_eq!(config.user_name, "Guest");
        assert_eq!(config.first_message, None);
        assert_eq!(config.language, None);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("BROKER_URL", "https://broker.internal");
            env::set_var("ENDPOINT_PREFIX", "wss://voice.internal");
            env::set_var("VOICE_AGENT", "secondary");
            env::set_var("SECONDARY_AGENT_ID", "agent-two");
            env::set_var("USER_NAME", "Dana");
            env::set_var("FIRST_MESSAGE", "Welcome back!");
            env::set_var("LANGUAGE", "de");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.endpoint_prefix, "wss://voice.internal");
        assert_eq!(config.agent, AgentSelector::Secondary);
        assert_eq!(config.secondary_agent_id, Some("agent-two".to_string()));
        assert_eq!(config.user_name, "Dana");
        assert_eq!(config.first_message, Some("Welcome back!".to_string()));
        assert_eq!(config.language, Some("de".to_string()));
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_broker_url() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "BROKER_URL"),
            _ => panic!("Expected MissingVar for BROKER_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_secondary_agent_requires_id() {
        clear_env_vars();
        unsafe {
            env::set_var("BROKER_URL", "https://broker.test");
            env::set_var("VOICE_AGENT", "secondary");
        }

        let err = Config::from_env().unwrap_err();
        match &err {
            ConfigError::MissingVar(var) => assert_eq!(var, "SECONDARY_AGENT_ID"),
            _ => panic!("Expected MissingVar for SECONDARY_AGENT_ID"),
        }
        // The message names the variable alone, like any other MissingVar.
        assert_eq!(
            format!("{}", err),
            "Missing environment variable: SECONDARY_AGENT_ID"
        );
    }

    #[test]
    #[serial]
    fn test_config_invalid_agent() {
        clear_env_vars();
        unsafe {
            env::set_var("BROKER_URL", "https://broker.test");
            env::set_var("VOICE_AGENT", "tertiary");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "VOICE_AGENT"),
            _ => panic!("Expected InvalidValue for VOICE_AGENT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("BROKER_URL", "https://broker.test");
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}

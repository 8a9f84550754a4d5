// src/config.rs
use std::path::PathBuf;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// JSON object merged into every completion request.
    pub extra_body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct BiConfig {
    pub docs_dir: Option<PathBuf>,
    pub db_path: PathBuf,
    pub embedding_model: Option<String>,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    pub top_k: usize,
    pub qdrant_url: Option<String>,
    pub qdrant_api_key: Option<String>,
    pub max_conversations: usize,
    pub conversation_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,
    /// `None` when no API key is configured; chat endpoints then answer 500.
    pub model: Option<ModelConfig>,
    pub system_message: String,
    pub bi: BiConfig,
    pub router_config: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model = match get("OPENAI_API_KEY") {
            Some(api_key) => Some(ModelConfig {
                api_key,
                base_url: get("OPENAI_API_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: get("OPENAI_API_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
                temperature: parse_or("OPENAI_TEMPERATURE", get("OPENAI_TEMPERATURE"), 0.0)?,
                max_tokens: parse_opt("OPENAI_MAX_TOKENS", get("OPENAI_MAX_TOKENS"))?,
                extra_body: parse_json_object("OPENAI_EXTRA_BODY", get("OPENAI_EXTRA_BODY"))?,
            }),
            None => None,
        };

        let bi = BiConfig {
            docs_dir: get("BI_DOCS_DIR").map(PathBuf::from),
            db_path: get("BI_DB_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./vector_db")),
            embedding_model: get("EMBEDDING_MODEL"),
            cache_size: parse_or("BI_CACHE_SIZE", get("BI_CACHE_SIZE"), 100)?,
            cache_ttl_secs: parse_or("BI_CACHE_TTL_SECS", get("BI_CACHE_TTL_SECS"), 3600)?,
            top_k: parse_or("BI_TOP_K", get("BI_TOP_K"), 5)?,
            qdrant_url: get("QDRANT_URL"),
            qdrant_api_key: get("QDRANT_API_KEY"),
            max_conversations: parse_or("BI_MAX_CONVERSATIONS", get("BI_MAX_CONVERSATIONS"), 1000)?,
            conversation_ttl_secs: parse_or("BI_CONVERSATION_TTL_SECS", get("BI_CONVERSATION_TTL_SECS"), 3600)?,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string()),
            model,
            system_message: get("AGENT_SYSTEM_MESSAGE").unwrap_or_else(|| "You are a helpful assistant.".to_string()),
            bi,
            router_config: get("ROUTER_CONFIG").map(PathBuf::from),
        })
    }
}

fn parse_opt<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_json_object(key: &'static str, value: Option<String>) -> Result<Option<Value>, ConfigError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(object @ Value::Object(_)) => Ok(Some(object)),
        Ok(_) => Err(ConfigError::InvalidValue {
            key,
            value: raw,
            reason: "expected a JSON object".to_string(),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(key, value)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.model.is_none());
        assert_eq!(config.bind_addr, "0.0.0.0:8001");
        assert_eq!(config.system_message, "You are a helpful assistant.");
        assert_eq!(config.bi.cache_size, 100);
        assert_eq!(config.bi.cache_ttl_secs, 3600);
        assert_eq!(config.bi.top_k, 5);
        assert_eq!(config.bi.db_path, PathBuf::from("./vector_db"));
        assert_eq!(config.bi.max_conversations, 1000);
        assert_eq!(config.bi.conversation_ttl_secs, 3600);
    }

    #[test]
    fn test_model_settings() {
        let config = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_MODEL", "deepseek-r1"),
            ("OPENAI_TEMPERATURE", "0.7"),
            ("OPENAI_MAX_TOKENS", "8192"),
            ("DATABASE_URL", ""),
        ])
        .unwrap();
        let model = config.model.unwrap();
        assert_eq!(model.model, "deepseek-r1");
        assert_eq!(model.base_url, "https://api.openai.com/v1");
        assert!((model.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(model.max_tokens, Some(8192));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_extra_body_must_be_object() {
        let config = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_EXTRA_BODY", r#"{"search_disable": false, "show_ref_label": true}"#),
        ])
        .unwrap();
        let extra = config.model.unwrap().extra_body.unwrap();
        assert_eq!(extra["show_ref_label"], true);

        let err = config_from(&[("OPENAI_API_KEY", "sk-test"), ("OPENAI_EXTRA_BODY", "[1, 2]")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "OPENAI_EXTRA_BODY", .. }));
        assert!(config_from(&[("OPENAI_API_KEY", "sk-test"), ("OPENAI_EXTRA_BODY", "{oops")]).is_err());
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let err = config_from(&[("BI_CACHE_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "BI_CACHE_SIZE", .. }));
    }
}

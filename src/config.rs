//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Railway/Docker
            port: 3000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// PostgreSQL schema the catalog reads and the validator allows
    pub namespace: String,
    pub require_tls: bool,
    /// Bounds connecting, waiting for a pooled slot and recycling
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "ecommerce_db".to_string(),
            max_pool_size: 10,
            namespace: "public".to_string(),
            require_tls: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// LLM provider configuration (any OpenAI-compatible chat completions endpoint)
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    /// Deadline for a single attempt
    pub timeout: Duration,
    pub sql_max_tokens: u32,
    pub answer_max_tokens: u32,
    /// Backoff before the single SQL generation retry
    pub retry_backoff: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            api_key: None,
            model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.0,
            timeout: Duration::from_secs(30),
            sql_max_tokens: 1024,
            answer_max_tokens: 512,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// What to return when the answer stage fails after rows were fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerFallback {
    /// Return the table with no answer text
    Raw,
    /// Surface the LLM error
    Fail,
}

impl FromStr for AnswerFallback {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "fail" => Ok(Self::Fail),
            other => Err(ConfigError::InvalidValue(format!(
                "ANSWER_FALLBACK must be 'raw' or 'fail', got '{}'",
                other
            ))),
        }
    }
}

/// Query pipeline limits
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub max_rows: u64,
    pub db_timeout: Duration,
    pub answer_fallback: AnswerFallback,
    pub answer_prompt_max_rows: usize,
    pub answer_prompt_max_columns: usize,
    pub answer_prompt_max_cell_chars: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            db_timeout: Duration::from_secs(15),
            answer_fallback: AnswerFallback::Raw,
            answer_prompt_max_rows: 50,
            answer_prompt_max_columns: 20,
            answer_prompt_max_cell_chars: 200,
        }
    }
}

/// Schema catalog configuration
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    pub cache_ttl: Duration,
    /// Example rows per table in the SQL prompt. Off by default since it
    /// sends table contents to the model provider.
    pub sample_rows: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            sample_rows: 0,
        }
    }
}

const MAX_SAMPLE_ROWS: usize = 20;

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub llm: LlmConfig,
    pub query: QueryConfig,
    pub schema: SchemaConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: env_parse("HOST").unwrap_or_else(|| ServerConfig::default().host),
            port: env_parse("PORT").unwrap_or_else(|| ServerConfig::default().port),
        };

        // Try to load DATABASE_URL first (modern format), fall back to individual vars
        let mut database = if let Ok(database_url) = std::env::var("DATABASE_URL") {
            Self::parse_database_url(&database_url)?
        } else {
            let defaults = DatabaseConfig::default();
            DatabaseConfig {
                host: std::env::var("DB_HOST").unwrap_or(defaults.host),
                port: env_parse("DB_PORT").unwrap_or(defaults.port),
                user: std::env::var("DB_USER").unwrap_or(defaults.user),
                password: std::env::var("DB_PASSWORD").unwrap_or_default(),
                database: std::env::var("DB_NAME").unwrap_or(defaults.database),
                ..defaults
            }
        };
        database.max_pool_size = env_parse("DB_MAX_CONNECTIONS").unwrap_or(database.max_pool_size);
        database.connect_timeout = env_parse("DB_CONNECT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(database.connect_timeout);
        if let Ok(namespace) = std::env::var("DB_SCHEMA") {
            if !namespace.trim().is_empty() {
                database.namespace = namespace.trim().to_string();
            }
        }
        database.require_tls = database.require_tls
            || env_flag("DB_SSLMODE_REQUIRE")
            || database.host.contains("neon.tech");

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            api_url: std::env::var("LLM_API_URL")
                .or_else(|_| std::env::var("GROQ_API_URL"))
                .unwrap_or(llm_defaults.api_url),
            api_key: std::env::var("LLM_API_KEY")
                .or_else(|_| std::env::var("GROQ_API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: std::env::var("LLM_MODEL")
                .or_else(|_| std::env::var("GROQ_MODEL"))
                .unwrap_or(llm_defaults.model),
            temperature: env_parse("LLM_TEMPERATURE").unwrap_or(llm_defaults.temperature),
            timeout: env_parse("LLM_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(llm_defaults.timeout),
            sql_max_tokens: env_parse("LLM_SQL_MAX_TOKENS").unwrap_or(llm_defaults.sql_max_tokens),
            answer_max_tokens: env_parse("LLM_ANSWER_MAX_TOKENS")
                .unwrap_or(llm_defaults.answer_max_tokens),
            retry_backoff: env_parse("LLM_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(llm_defaults.retry_backoff),
        };

        let query_defaults = QueryConfig::default();
        let query = QueryConfig {
            max_rows: env_parse("MAX_QUERY_ROWS").unwrap_or(query_defaults.max_rows),
            db_timeout: env_parse("DB_QUERY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(query_defaults.db_timeout),
            answer_fallback: match std::env::var("ANSWER_FALLBACK") {
                Ok(value) => value.parse()?,
                Err(_) => query_defaults.answer_fallback,
            },
            answer_prompt_max_rows: env_parse("ANSWER_PROMPT_MAX_ROWS")
                .unwrap_or(query_defaults.answer_prompt_max_rows),
            answer_prompt_max_columns: env_parse("ANSWER_PROMPT_MAX_COLUMNS")
                .unwrap_or(query_defaults.answer_prompt_max_columns),
            answer_prompt_max_cell_chars: env_parse("ANSWER_PROMPT_MAX_CELL_CHARS")
                .unwrap_or(query_defaults.answer_prompt_max_cell_chars),
        };

        let schema_defaults = SchemaConfig::default();
        let schema = SchemaConfig {
            cache_ttl: env_parse("SCHEMA_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(schema_defaults.cache_ttl),
            sample_rows: env_parse("SCHEMA_SAMPLE_ROWS").unwrap_or(schema_defaults.sample_rows),
        };

        let settings = Self {
            server,
            database,
            cors,
            llm,
            query,
            schema,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.max_rows == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_QUERY_ROWS must be at least 1".to_string(),
            ));
        }
        if self.query.db_timeout.is_zero() || self.llm.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "LLM_TIMEOUT_SECS and DB_QUERY_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if self.database.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "DB_CONNECT_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if self.schema.sample_rows > MAX_SAMPLE_ROWS {
            return Err(ConfigError::InvalidValue(format!(
                "SCHEMA_SAMPLE_ROWS must be at most {}",
                MAX_SAMPLE_ROWS
            )));
        }
        if self.database.namespace.contains('"') {
            return Err(ConfigError::InvalidValue(
                "DB_SCHEMA must be a plain schema name".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let host = parsed.host_str()
                    .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
                    .to_string();

                let port = parsed.port().unwrap_or(5432);

                let user = parsed.username().to_string();
                let password = parsed.password()
                    .map(|p| p.to_string())
                    .unwrap_or_default();

                let database = parsed.path()
                    .trim_start_matches('/')
                    .to_string();

                let require_tls = parsed
                    .query_pairs()
                    .any(|(k, v)| k == "sslmode" && (v == "require" || v == "verify-full"));

                Ok(DatabaseConfig {
                    host,
                    port,
                    user,
                    password,
                    database,
                    require_tls,
                    ..DatabaseConfig::default()
                })
            }
            Err(_) => Err(ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string()
            ))
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Ok("1" | "true" | "yes")
    )
}

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub vision: VisionConfig,
    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// multipart 请求体上限
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// 慢查询日志阈值
    pub slow_statement_secs: u64,
}

/// 视觉模型 (发票字段抽取)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub base_url: String,
    pub api_key: Secret,
    pub model: String,
    pub timeout_secs: u64,
    pub max_image_bytes: usize,
}

/// 托管 assistant (聊天接口)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub base_url: String,
    pub api_key: Secret,
    pub assistant_id: String,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

/// API key 包装, Debug 输出时脱敏
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

impl AppConfig {
    /// 加载配置: 默认值 -> config/default.toml -> config/local.toml -> APP__* 环境变量
    ///
    /// 兼容旧的 SERVER_HOST / SERVER_PORT / DATABASE_URL / OPENAI_API_KEY 环境变量。
    pub fn load() -> Result<Self, ConfigError> {
        let openai_key = std::env::var("OPENAI_API_KEY").ok();

        Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080_i64)?
            .set_default("server.max_upload_bytes", 20_i64 * 1024 * 1024)?
            .set_default("database.url", "postgres://localhost/rental_audit")?
            .set_default("database.max_connections", 20_i64)?
            .set_default("database.acquire_timeout_secs", 10_i64)?
            .set_default("database.slow_statement_secs", 5_i64)?
            .set_default("vision.base_url", "https://api.openai.com/v1")?
            .set_default("vision.api_key", "")?
            .set_default("vision.model", "gpt-4o")?
            .set_default("vision.timeout_secs", 120_i64)?
            .set_default("vision.max_image_bytes", 15_i64 * 1024 * 1024)?
            .set_default("assistant.base_url", "https://api.openai.com/v1")?
            .set_default("assistant.api_key", "")?
            .set_default("assistant.assistant_id", "")?
            .set_default("assistant.poll_interval_ms", 1000_i64)?
            .set_default("assistant.max_polls", 60_i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("vision.api_key", openai_key.clone())?
            .set_override_option("assistant.api_key", openai_key)?
            .build()?
            .try_deserialize()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

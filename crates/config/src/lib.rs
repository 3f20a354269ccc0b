//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 服务监听地址
//! - 数据库连接（缺省时使用内存存储）
//! - JWT 连接认证
//! - 实时通道参数（出站队列容量、清扫间隔、编辑窗口、振铃超时）
//!
//! 加载顺序：默认值 -> 可选配置文件（APP_CONFIG_FILE）-> 环境变量（APP_*，嵌套用 `__`）。

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[serde(default)]
    #[validate(nested)]
    pub realtime: RealtimeConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// 数据库配置；`url` 为空时使用进程内存储
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[validate(url)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    #[validate(length(min = 32))]
    pub secret: String,
    #[validate(range(min = 1))]
    pub expiration_hours: i64,
}

/// 在线状态可见范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceVisibility {
    /// 所有在线连接都能看到
    Global,
    /// 只有与该用户共享会话的人能看到
    #[default]
    SharedChats,
}

/// 实时通道配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 每个连接的出站队列容量，写满后丢弃
    #[validate(range(min = 1))]
    pub outbound_capacity: usize,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
    #[validate(range(min = 1, max = 2_592_000))]
    pub edit_window_secs: u64,
    #[validate(range(min = 1, max = 3_600))]
    pub ring_timeout_secs: u64,
    pub typing_cache_ttl_ms: u64,
    pub presence_visibility: PresenceVisibility,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            sweep_interval_secs: 60,
            edit_window_secs: 3600,
            ring_timeout_secs: 45,
            typing_cache_ttl_ms: 5_000,
            presence_visibility: PresenceVisibility::SharedChats,
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AppConfig {
    /// 开发环境默认值；生产环境必须通过文件或环境变量覆盖 JWT 密钥
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                cors_origins: vec!["*".into()],
            },
            database: DatabaseConfig::default(),
            jwt: JwtConfig {
                secret: "dev-secret-key-not-for-production-use-minimum-32-chars".into(),
                expiration_hours: 24,
            },
            realtime: RealtimeConfig::default(),
        }
    }
}

impl AppConfig {
    /// 按优先级加载配置：默认值 -> 可选文件 -> 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Self::defaults();
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            fig = match ConfigFormat::from_path(&path) {
                ConfigFormat::Yaml => fig.merge(Yaml::file(path)),
                ConfigFormat::Json => fig.merge(Json::file(path)),
                ConfigFormat::Toml => fig.merge(Toml::file(path)),
            };
        }
        Self::extract(fig.merge(Env::prefixed("APP_").split("__")))
    }

    /// 解析一段配置文本，未给出的字段取默认值。不读取环境变量
    pub fn parse(source: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let fig = Self::defaults();
        Self::extract(match format {
            ConfigFormat::Yaml => fig.merge(Yaml::string(source)),
            ConfigFormat::Json => fig.merge(Json::string(source)),
            ConfigFormat::Toml => fig.merge(Toml::string(source)),
        })
    }

    fn defaults() -> Figment {
        Figment::new().merge(Serialized::defaults(AppConfig::default()))
    }

    fn extract(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = fig.extract().map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 日志用的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut redacted = self.clone();
        redacted.jwt.secret = "[REDACTED]".into();
        if let Some(url) = redacted.database.url.as_mut() {
            if let Some(at) = url.rfind('@') {
                *url = format!("postgres://[REDACTED]{}", &url[at..]);
            }
        }
        format!("{:?}", redacted)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// 按扩展名判断，无法识别时按 TOML 处理
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".yml") || path.ends_with(".yaml") {
            ConfigFormat::Yaml
        } else if path.ends_with(".json") {
            ConfigFormat::Json
        } else {
            ConfigFormat::Toml
        }
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.database.url.is_none());
        assert_eq!(config.realtime.edit_window_secs, 3600);
    }

    #[test]
    fn parses_toml_with_partial_realtime_section() {
        let config = AppConfig::parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [jwt]
            secret = "production-grade-secret-key-with-sufficient-length"
            expiration_hours = 12

            [realtime]
            sweep_interval_secs = 5
            presence_visibility = "global"
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.realtime.sweep_interval_secs, 5);
        assert_eq!(config.realtime.outbound_capacity, 256);
        assert_eq!(
            config.realtime.presence_visibility,
            PresenceVisibility::Global
        );
    }

    #[test]
    fn parses_yaml_with_flow_sequence() {
        let config = AppConfig::parse(
            "server:\n  host: 127.0.0.1\n  port: 8081\n  cors_origins: [\"https://chat.example.com\"]\njwt:\n  secret: production-grade-secret-key-with-sufficient-length\n  expiration_hours: 1\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.cors_origins, vec!["https://chat.example.com"]);
        assert_eq!(config.realtime.outbound_capacity, 256);
    }

    #[test]
    fn parses_partial_json() {
        let config =
            AppConfig::parse(r#"{"database": {"url": "postgres://db/chat"}}"#, ConfigFormat::Json)
                .unwrap();
        assert_eq!(config.database.url.as_deref(), Some("postgres://db/chat"));
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn parsed_config_is_validated() {
        let result = AppConfig::parse("[jwt]\nsecret = \"short\"\n", ConfigFormat::Toml);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn format_follows_file_extension() {
        assert_eq!(ConfigFormat::from_path("app.yaml"), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path("app.yml"), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path("app.json"), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path("app.toml"), ConfigFormat::Toml);
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut config = AppConfig::default();
        config.jwt.secret = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = AppConfig::default();
        config.realtime.outbound_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sanitize_hides_credentials() {
        let mut config = AppConfig::default();
        config.database.url = Some("postgres://user:pass@db:5432/chat".into());
        let text = config.sanitize();
        assert!(!text.contains("pass@"));
        assert!(!text.contains("dev-secret"));
        assert!(text.contains("@db:5432/chat"));
    }
}

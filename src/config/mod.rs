use std::env;
use std::time::Duration;

mod duration;

pub use duration::parse_duration_secs;

/// 配置加载错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub store_kind: StoreKind,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    pub redis_command_timeout_ms: u64,
    pub redis_max_retries: u32,
    pub cache_default_namespace: String,
    pub cache_scan_batch: usize,
    pub rate_limit_limit: u32,
    pub rate_limit_window_ms: u64,
    pub breaker_timeout_ms: u64,
    pub breaker_error_threshold: u8,
    pub breaker_reset_timeout_ms: u64,
    pub breaker_volume_threshold: u32,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub jwt_expiration_secs: u64,
    pub jwt_refresh_expiration_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// 从任意键值来源构建配置，便于测试
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let or_default = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let store_kind = match or_default("STORE_BACKEND", "redis").to_lowercase().as_str() {
            "redis" => StoreKind::Redis,
            "memory" => StoreKind::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                });
            }
        };

        let jwt_expiration = or_default("JWT_EXPIRATION", "15m");
        let jwt_refresh_expiration = or_default("JWT_REFRESH_EXPIRATION", "7d");

        let breaker_error_threshold: u8 =
            parse("CIRCUIT_BREAKER_ERROR_THRESHOLD", &or_default("CIRCUIT_BREAKER_ERROR_THRESHOLD", "50"))?;
        if breaker_error_threshold > 100 {
            return Err(ConfigError::Invalid {
                name: "CIRCUIT_BREAKER_ERROR_THRESHOLD",
                value: breaker_error_threshold.to_string(),
            });
        }

        Ok(Config {
            server_host: or_default("SERVER_HOST", "0.0.0.0"),
            server_port: parse("SERVER_PORT", &or_default("SERVER_PORT", "3000"))?,
            store_kind,
            redis_host: or_default("REDIS_HOST", "127.0.0.1"),
            redis_port: parse("REDIS_PORT", &or_default("REDIS_PORT", "6379"))?,
            redis_password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
            redis_db: parse("REDIS_DB", &or_default("REDIS_DB", "0"))?,
            redis_command_timeout_ms: parse(
                "REDIS_COMMAND_TIMEOUT_MS",
                &or_default("REDIS_COMMAND_TIMEOUT_MS", "2000"),
            )?,
            redis_max_retries: parse("REDIS_MAX_RETRIES", &or_default("REDIS_MAX_RETRIES", "3"))?,
            cache_default_namespace: or_default("CACHE_DEFAULT_NAMESPACE", "cache"),
            cache_scan_batch: parse("CACHE_SCAN_BATCH", &or_default("CACHE_SCAN_BATCH", "100"))?,
            rate_limit_limit: parse("RATE_LIMIT_LIMIT", &or_default("RATE_LIMIT_LIMIT", "100"))?,
            rate_limit_window_ms: parse(
                "RATE_LIMIT_WINDOW_MS",
                &or_default("RATE_LIMIT_WINDOW_MS", "60000"),
            )?,
            breaker_timeout_ms: parse(
                "CIRCUIT_BREAKER_TIMEOUT_MS",
                &or_default("CIRCUIT_BREAKER_TIMEOUT_MS", "3000"),
            )?,
            breaker_error_threshold,
            breaker_reset_timeout_ms: parse(
                "CIRCUIT_BREAKER_RESET_TIMEOUT_MS",
                &or_default("CIRCUIT_BREAKER_RESET_TIMEOUT_MS", "30000"),
            )?,
            breaker_volume_threshold: parse(
                "CIRCUIT_BREAKER_VOLUME_THRESHOLD",
                &or_default("CIRCUIT_BREAKER_VOLUME_THRESHOLD", "10"),
            )?,
            jwt_secret: required("JWT_SECRET")?,
            jwt_refresh_secret: required("JWT_REFRESH_SECRET")?,
            jwt_expiration_secs: parse_duration_secs(&jwt_expiration).ok_or(ConfigError::Invalid {
                name: "JWT_EXPIRATION",
                value: jwt_expiration.clone(),
            })?,
            jwt_refresh_expiration_secs: parse_duration_secs(&jwt_refresh_expiration).ok_or(
                ConfigError::Invalid {
                    name: "JWT_REFRESH_EXPIRATION",
                    value: jwt_refresh_expiration.clone(),
                },
            )?,
        })
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db),
        }
    }

    pub fn redis_command_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_command_timeout_ms)
    }

    pub fn jwt_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_expiration_secs)
    }

    pub fn jwt_refresh_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_refresh_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- 速率控制 ---
    /// 每分钟允许消耗的额度（token 估算单位），同时也是令牌桶容量
    pub rate_per_minute: u32,
    /// 同时在途的评分请求上限
    pub max_concurrency: usize,
    /// 两次请求之间的最小间隔（毫秒）
    pub min_request_interval_ms: u64,

    // --- 拆分 ---
    /// 超过该估算额度的内容需要拆分
    pub chunk_size_ceiling: usize,
    /// 递归拆分的下限，低于它直接降级
    pub chunk_floor: usize,

    // --- 缓存与重试 ---
    pub cache_enabled: bool,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub max_backoff_seconds: f64,

    // --- 批次调度 ---
    pub wave_delay_floor_ms: u64,
    pub wave_delay_ceiling_ms: u64,

    /// Diff 文件存放目录
    pub diff_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,

    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_per_minute: 60_000,
            max_concurrency: 4,
            min_request_interval_ms: 0,
            chunk_size_ceiling: 8_000,
            chunk_floor: 250,
            cache_enabled: true,
            max_retries: 3,
            backoff_base_seconds: 1.0,
            max_backoff_seconds: 30.0,
            wave_delay_floor_ms: 500,
            wave_delay_ceiling_ms: 10_000,
            diff_folder: "diffs".to_string(),
            verbose_logging: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_temperature: 0.2,
            llm_max_tokens: 1024,
        }
    }
}

impl Config {
    /// 从环境变量读取配置，无法解析的值回退到默认值
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件读取配置，缺失的字段使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 加载配置：`CONFIG_FILE` 指定的 TOML 文件（可选）+ 环境变量覆盖，并校验
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("CONFIG_FILE") {
            Ok(path) => Self::from_toml_file(path)?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Self {
        Self {
            rate_per_minute: env_or("RATE_PER_MINUTE", self.rate_per_minute),
            max_concurrency: env_or("MAX_CONCURRENCY", self.max_concurrency),
            min_request_interval_ms: env_or("MIN_REQUEST_INTERVAL_MS", self.min_request_interval_ms),
            chunk_size_ceiling: env_or("CHUNK_SIZE_CEILING", self.chunk_size_ceiling),
            chunk_floor: env_or("CHUNK_FLOOR", self.chunk_floor),
            cache_enabled: env_or("CACHE_ENABLED", self.cache_enabled),
            max_retries: env_or("MAX_RETRIES", self.max_retries),
            backoff_base_seconds: env_or("BACKOFF_BASE_SECONDS", self.backoff_base_seconds),
            max_backoff_seconds: env_or("MAX_BACKOFF_SECONDS", self.max_backoff_seconds),
            wave_delay_floor_ms: env_or("WAVE_DELAY_FLOOR_MS", self.wave_delay_floor_ms),
            wave_delay_ceiling_ms: env_or("WAVE_DELAY_CEILING_MS", self.wave_delay_ceiling_ms),
            diff_folder: std::env::var("DIFF_FOLDER").unwrap_or(self.diff_folder),
            verbose_logging: env_or("VERBOSE_LOGGING", self.verbose_logging),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name),
            llm_temperature: env_or("LLM_TEMPERATURE", self.llm_temperature),
            llm_max_tokens: env_or("LLM_MAX_TOKENS", self.llm_max_tokens),
        }
    }

    /// 校验配置是否可用
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_per_minute == 0 {
            return Err(invalid("rate_per_minute", "必须大于 0"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "必须大于 0"));
        }
        if self.chunk_floor == 0 || self.chunk_floor > self.chunk_size_ceiling {
            return Err(invalid(
                "chunk_floor",
                format!("必须在 1 到 chunk_size_ceiling ({}) 之间", self.chunk_size_ceiling),
            ));
        }
        if !(self.backoff_base_seconds >= 0.0) || !(self.max_backoff_seconds >= 0.0) {
            return Err(invalid("backoff_base_seconds", "退避时间不能为负数"));
        }
        if self.wave_delay_floor_ms > self.wave_delay_ceiling_ms {
            return Err(invalid("wave_delay_floor_ms", "不能大于 wave_delay_ceiling_ms"));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(var_name: &str, default: T) -> T {
    match std::env::var(var_name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(
                    "{}",
                    ConfigError::EnvVarParseFailed {
                        var_name: var_name.to_string(),
                        value,
                        expected_type: std::any::type_name::<T>().to_string(),
                    }
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

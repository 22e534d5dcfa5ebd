use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 正则表达式编译错误
    #[error("正则表达式错误: {0}")]
    Pattern(#[from] regex::Error),
}

/// 评分服务错误
///
/// 评分能力只会以这四类错误失败，上层只依赖这一分类。
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    /// 请求频率限制（可恢复：退避、重试、降速）
    #[error("请求频率限制, 建议等待: {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    /// 输入超过上下文长度（可恢复：拆分后重试）
    #[error("输入超过上下文长度: {message}")]
    ContextTooLarge { message: String },
    /// 临时错误（可恢复：指数退避重试）
    #[error("临时错误: {message}")]
    Transient { message: String },
    /// 致命错误（不重试，降级为默认结果）
    #[error("致命错误: {message}")]
    Fatal { message: String },
}

impl ScoringError {
    pub fn transient(message: impl Into<String>) -> Self {
        ScoringError::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ScoringError::Fatal {
            message: message.into(),
        }
    }

    pub fn context_too_large(message: impl Into<String>) -> Self {
        ScoringError::ContextTooLarge {
            message: message.into(),
        }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("解析配置文件失败 ({path}): {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Diff 读取错误
#[derive(Debug, Error)]
pub enum DiffError {
    /// 目录不存在
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: PathBuf },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

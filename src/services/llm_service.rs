//! LLM 服务 - 业务能力层
//!
//! 只负责"把一段提示词发给评分服务并拿回原始文本"能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use std::sync::OnceLock;
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ScoringError;

/// 评分能力
///
/// 评分核心只依赖这一个接口：发送提示词，拿回原始文本，
/// 或者以四类错误之一失败。测试中用脚本化实现替换。
#[async_trait]
pub trait ScoringCapability: Send + Sync {
    async fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ScoringError>;
}

/// LLM 服务
///
/// 职责：
/// - 调用兼容 OpenAI 的聊天接口
/// - 把接口错误归类为 [`ScoringError`]
/// - 不解析回复内容，不重试
pub struct LlmService {
    client: Client<OpenAIConfig>,
    model_name: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        let client = Client::with_config(openai_config);

        Self {
            client,
            model_name: config.llm_model_name.clone(),
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 通用的 LLM 调用函数
    ///
    /// # 参数
    /// - `user_message`: 用户消息内容
    /// - `system_message`: 系统消息
    ///
    /// # 返回
    /// 返回 LLM 的响应内容（字符串），失败时返回已归类的错误
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: &str,
    ) -> Result<String, ScoringError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_message)
            .build()
            .map_err(|e| ScoringError::fatal(format!("构建系统消息失败: {}", e)))?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(|e| ScoringError::fatal(format!("构建用户消息失败: {}", e)))?;

        let messages = vec![
            ChatCompletionRequestMessage::System(system_msg),
            ChatCompletionRequestMessage::User(user_msg),
        ];

        // 构建请求
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(|e| ScoringError::fatal(format!("构建请求失败: {}", e)))?;

        // 调用 API
        let response = self.client.chat().create(request).await.map_err(|e| {
            let error = classify_error_message(&e.to_string());
            warn!("LLM API 调用失败: {}", error);
            error
        })?;

        debug!("LLM API 调用成功");

        // 提取响应内容
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ScoringError::transient("LLM 返回内容为空"))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl ScoringCapability for LlmService {
    async fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ScoringError> {
        self.send_to_llm(user_prompt, system_prompt).await
    }
}

/// 根据错误文本归类
///
/// 兼容各家 OpenAI 风格服务的报错措辞，只看文本而不依赖具体错误类型。
/// 上下文超长先于限流判断；状态码按完整数字匹配，避免命中 token 计数之类的数字。
pub fn classify_error_message(message: &str) -> ScoringError {
    let lower = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if contains_any(&[
        "context_length",
        "context length",
        "maximum context",
        "too many tokens",
        "too large",
        "reduce the length",
    ]) {
        return ScoringError::context_too_large(message);
    }
    if has_status_code(&lower, &["429"])
        || contains_any(&["rate limit", "rate_limit", "too many requests"])
    {
        return ScoringError::RateLimited {
            retry_after: parse_retry_after(&lower),
        };
    }
    if has_status_code(&lower, &["500", "502", "503", "504"])
        || contains_any(&[
            "http error",
            "timed out",
            "timeout",
            "connection",
            "overloaded",
            "temporarily unavailable",
        ])
    {
        return ScoringError::transient(message);
    }
    ScoringError::fatal(message)
}

/// 文本中是否出现独立的状态码（前后不紧挨数字或字母）
fn has_status_code(lower: &str, codes: &[&str]) -> bool {
    static NUMBERS: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = NUMBERS.get_or_init(|| Regex::new(r"\b\d{3}\b").ok()) else {
        return false;
    };
    re.find_iter(lower).any(|m| codes.contains(&m.as_str()))
}

/// 从错误文本中取出 "retry after 12s" / "try again in 1.5s" 之类的等待时间
fn parse_retry_after(lower: &str) -> Option<Duration> {
    static RETRY_AFTER: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RETRY_AFTER
        .get_or_init(|| {
            Regex::new(r"(?:retry[- ]after|try again in)[:\s]*(\d+(?:\.\d+)?)\s*(ms|s|seconds?)?").ok()
        })
        .as_ref()?;
    let caps = re.captures(lower)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let seconds = match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => value / 1000.0,
        _ => value,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_with_hint() {
        let error = classify_error_message(
            "Rate limit reached for gpt-4o-mini. Please try again in 1.5s.",
        );
        assert_eq!(
            error,
            ScoringError::RateLimited {
                retry_after: Some(Duration::from_millis(1500))
            }
        );

        let error = classify_error_message("http status 429");
        assert_eq!(error, ScoringError::RateLimited { retry_after: None });
    }

    #[test]
    fn test_token_counts_are_not_status_codes() {
        let error = classify_error_message(
            "This model's maximum context length is 128000 tokens. However, your messages resulted in 142900 tokens.",
        );
        assert!(matches!(error, ScoringError::ContextTooLarge { .. }));

        // 数字里含有 429 / 500 但并非状态码
        assert!(matches!(
            classify_error_message("invalid request id req_14290 for 5000 items"),
            ScoringError::Fatal { .. }
        ));
        assert!(matches!(
            classify_error_message("upstream returned status 503"),
            ScoringError::Transient { .. }
        ));
        assert!(has_status_code("error code: 429 - slow down", &["429"]));
    }

    #[test]
    fn test_classify_context_too_large() {
        let error = classify_error_message(
            "This model's maximum context length is 128000 tokens (context_length_exceeded)",
        );
        assert!(matches!(error, ScoringError::ContextTooLarge { .. }));
    }

    #[test]
    fn test_classify_transient_and_fatal() {
        assert!(matches!(
            classify_error_message("http error: connection reset by peer"),
            ScoringError::Transient { .. }
        ));
        assert!(matches!(
            classify_error_message("The server is overloaded"),
            ScoringError::Transient { .. }
        ));
        assert!(matches!(
            classify_error_message("Incorrect API key provided"),
            ScoringError::Fatal { .. }
        ));
    }

    #[test]
    fn test_service_uses_configured_model() {
        let config = Config {
            llm_model_name: "test-model".to_string(),
            ..Config::default()
        };
        let service = LlmService::new(&config);
        assert_eq!(service.model_name(), "test-model");
    }

    /// 测试 LLM API 连接性（需要真实的 API Key）
    #[tokio::test]
    #[ignore]
    async fn test_send_to_llm_simple() {
        let _ = tracing_subscriber::fmt::try_init();

        let service = LlmService::new(&Config::from_env());
        let response = service
            .send(&crate::services::prompt::system_prompt(), "+fn main() {}\n")
            .await
            .unwrap();

        println!("\n========== LLM 响应 ==========");
        println!("{}", response);
        assert!(!response.is_empty());
    }
}

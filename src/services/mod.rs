//! 业务能力层（Services Layer）
//!
//! 每个服务只描述"我能做什么"，只处理单个请求或单段文本：
//! - `LlmService` - 调用评分服务
//! - `InputSegmenter` - 拆分超长输入
//! - `ResponseNormalizer` - 把自由文本回复规范化为评分结构
//! - `merge` - 合并分块结果
//! - `prompt` - 构建提示词

pub mod llm_service;
pub mod merge;
pub mod normalizer;
pub mod prompt;
pub mod segmenter;

pub use llm_service::{classify_error_message, LlmService, ScoringCapability};
pub use merge::merge_chunk_results;
pub use normalizer::ResponseNormalizer;
pub use segmenter::{CostEstimator, HeuristicEstimator, InputSegmenter};

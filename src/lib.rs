//! # Diff Evaluator
//!
//! 一个自适应限速的代码变更批量评分引擎
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有进程内共享资源，只暴露能力
//! - `RateController` - 令牌桶额度 + 自适应降速 / 恢复
//! - `ResultMemo` - 按内容哈希缓存评分结果
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个请求
//! - `LlmService` - 评分调用能力（`ScoringCapability`）
//! - `InputSegmenter` - 超长输入拆分能力
//! - `ResponseNormalizer` - 回复规范化能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个文件 diff"的完整评分流程
//! - `RequestCtx` - 上下文封装（提交 + 文件）
//! - `EvaluationFlow` - 流程编排（缓存 → 拆分 → 调用 → 规范化 → 合并）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_scheduler` - 分波派发，管理并发和波间延迟
//! - `orchestrator/evaluator` - 批量评分入口，结果汇总
//! - `orchestrator/app` - 应用入口，加载 diff 并逐个提交评分
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ConfigError, DiffError, ScoringError};
pub use infrastructure::{RateController, RateControllerConfig, ResultMemo};
pub use models::{CommitDiff, Dimension, Provenance, ScoreRequest, ScoreResult};
pub use orchestrator::{App, BatchReport, BatchSummary, CancelHandle, CommitReport, Evaluator};
pub use services::{LlmService, ScoringCapability};

//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量评分和波次调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 管理应用生命周期（初始化、运行）
//! - 加载全部提交，逐个交给评分器
//! - 输出全局统计信息
//!
//! ### `evaluator` - 批量评分器
//! - 批内去重，按输入顺序返回结果
//! - 汇总直接评分 / 分块合并 / 降级 / 缓存命中
//! - 提交级别的结果聚合
//!
//! ### `batch_scheduler` - 批次调度器
//! - 额度小的请求先派发
//! - 每波大小受控制器当前并发上限约束
//! - 波间延迟与取消
//!
//! ## 层次关系
//!
//! ```text
//! app (处理 Vec<CommitDiff>)
//!     ↓
//! evaluator (处理 Vec<ScoreRequest>)
//!     ↓
//! batch_scheduler (分波派发)
//!     ↓
//! workflow::EvaluationFlow (处理单个 ScoreRequest)
//!     ↓
//! services (能力层：llm / segmenter / normalizer / merge)
//!     ↓
//! infrastructure (基础设施：RateController / ResultMemo)
//! ```

pub mod app;
pub mod batch_scheduler;
pub mod evaluator;

// 重新导出主要类型
pub use app::App;
pub use batch_scheduler::{BatchScheduler, CancelHandle, SchedulerConfig, Slot};
pub use evaluator::{BatchReport, BatchSummary, CommitReport, Evaluator, ScoredItem};

//! 基础设施层（Infrastructure Layer）
//!
//! 持有进程内共享的稀缺资源，只对外暴露能力：
//! - `RateController` - 额度与并发上限
//! - `ResultMemo` - 按内容哈希缓存的评分结果

pub mod rate_controller;
pub mod result_memo;

pub use rate_controller::{RateController, RateControllerConfig, RateSnapshot};
pub use result_memo::{MemoStats, ResultMemo};

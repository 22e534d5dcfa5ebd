//! 评分请求上下文
//!
//! 封装"我正在处理哪个提交的第几个文件"这一信息

use std::fmt::Display;

/// 评分请求上下文
///
/// 只用于日志显示，不参与评分逻辑
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// 所属范围（提交短哈希，或批次名）
    pub scope: String,

    /// 请求标识（一般是文件路径）
    pub request_id: String,

    /// 请求在批次中的位置（从1开始）
    pub position: usize,

    /// 批次中的请求总数
    pub total: usize,
}

impl RequestCtx {
    /// 创建新的请求上下文
    pub fn new(
        scope: impl Into<String>,
        request_id: impl Into<String>,
        position: usize,
        total: usize,
    ) -> Self {
        Self {
            scope: scope.into(),
            request_id: request_id.into(),
            position,
            total,
        }
    }
}

impl Display for RequestCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} {}/{} 文件#{}]",
            self.scope, self.position, self.total, self.request_id
        )
    }
}

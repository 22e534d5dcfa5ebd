use serde::{Deserialize, Serialize};

/// 一次评分请求（通常对应一个提交中的一个文件 diff）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRequest {
    /// 请求标识，一般是文件路径
    pub id: String,
    /// 待评分的 diff 文本
    pub content: String,
    /// 估算的额度消耗（偏高估）
    pub estimated_cost: usize,
}

impl ScoreRequest {
    pub fn new(id: impl Into<String>, content: impl Into<String>, estimated_cost: usize) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            estimated_cost,
        }
    }
}

/// 超长请求的拆分方案
///
/// 分块按原始顺序排列，依次拼接即可还原原始内容。
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub parent_id: String,
    /// 生成该方案时使用的单块上限
    pub cap: usize,
    pub chunks: Vec<ScoreRequest>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 拼接所有分块内容
    pub fn reassemble(&self) -> String {
        self.chunks.iter().map(|c| c.content.as_str()).collect()
    }
}

use serde::{Deserialize, Serialize};

/// 提交元信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    pub hash: String,
    pub author: String,
    pub date: String,
    pub message: String,
}

/// 单个文件的 diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub diff: String,
}

/// 一个提交及其全部文件 diff
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitDiff {
    pub meta: CommitMeta,
    pub files: Vec<FileDiff>,
    /// 来源文件路径（仅用于日志）
    #[serde(skip)]
    pub source_path: Option<String>,
}

impl CommitDiff {
    /// 简短哈希，用于日志显示
    pub fn short_hash(&self) -> &str {
        let hash = self.meta.hash.as_str();
        match hash.char_indices().nth(8) {
            Some((idx, _)) => &hash[..idx],
            None => hash,
        }
    }
}

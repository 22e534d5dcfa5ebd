//! 结果缓存 - 基础设施层
//!
//! 以内容哈希为键缓存评分结果。只增不减，生命周期与持有者相同，没有淘汰策略。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::ScoreResult;

/// 缓存命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl MemoStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 结果缓存句柄
#[derive(Clone, Default)]
pub struct ResultMemo {
    store: Arc<RwLock<HashMap<String, ScoreResult>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResultMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内容的确定性哈希（SHA-256 十六进制）
    pub fn key_for(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    pub fn get(&self, hash: &str) -> Option<ScoreResult> {
        let found = self
            .store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(hash)
            .cloned();

        match found {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %short(hash), "cache hit");
                Some(result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %short(hash), "cache miss");
                None
            }
        }
    }

    pub fn put(&self, hash: impl Into<String>, result: ScoreResult) {
        self.store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(hash.into(), result);
    }

    /// 在批次内去重时复用结果，也计为一次命中
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = ResultMemo::key_for("+ let x = 1;\n");
        let b = ResultMemo::key_for("+ let x = 1;\n");
        let c = ResultMemo::key_for("+ let x = 2;\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_get_put_and_stats() {
        let memo = ResultMemo::new();
        let key = ResultMemo::key_for("content");

        assert!(memo.get(&key).is_none());
        memo.put(key.clone(), ScoreResult::degraded("占位"));
        assert!(memo.get(&key).is_some());

        let stats = memo.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_clones_share_storage() {
        let memo = ResultMemo::new();
        let other = memo.clone();
        other.put("k", ScoreResult::degraded("占位"));
        assert_eq!(memo.len(), 1);
    }
}

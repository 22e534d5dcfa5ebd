//! 输入拆分服务 - 业务能力层
//!
//! 只负责"把超长 diff 拆成有序分块"能力：
//! - 尽量按行边界拆分，单行超长时按字符硬拆
//! - 分块依次拼接可还原原始内容
//! - 评分服务明确报告上下文超长时，单块上限减半后重拆，低于下限则放弃

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::models::{ChunkPlan, ScoreRequest};

/// 额度估算
///
/// 实现必须偏向高估，且对按行拼接满足次可加性（各部分估算之和不小于整体估算）。
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// 基于字符数与词数的启发式估算，取两者较大值并额外放大 10%
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl CostEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        let words = text.split_whitespace().count() as f64;
        let by_chars = chars / 3.5;
        let by_words = words * 1.35;
        (by_chars.max(by_words) * 1.1).ceil() as usize
    }
}

/// 输入拆分服务
#[derive(Clone)]
pub struct InputSegmenter {
    ceiling: usize,
    floor: usize,
    estimator: Arc<dyn CostEstimator>,
}

impl InputSegmenter {
    pub fn new(ceiling: usize, floor: usize) -> Self {
        Self::with_estimator(ceiling, floor, Arc::new(HeuristicEstimator))
    }

    /// 使用自定义估算器（例如精确的分词计数）
    pub fn with_estimator(ceiling: usize, floor: usize, estimator: Arc<dyn CostEstimator>) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            floor: floor.clamp(1, ceiling),
            estimator,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.chunk_size_ceiling, config.chunk_floor)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    /// 首次拆分使用的单块上限（上限的四分之三）
    pub fn chunk_cap(&self) -> usize {
        (self.ceiling * 3 / 4).max(self.floor)
    }

    pub fn estimate(&self, content: &str) -> usize {
        self.estimator.estimate(content)
    }

    /// 构建带估算额度的请求
    pub fn request(&self, id: impl Into<String>, content: impl Into<String>) -> ScoreRequest {
        let content = content.into();
        let cost = self.estimate(&content);
        ScoreRequest::new(id, content, cost)
    }

    pub fn is_oversized(&self, request: &ScoreRequest) -> bool {
        request.estimated_cost > self.ceiling
    }

    /// 首次拆分
    pub fn plan(&self, request: &ScoreRequest) -> ChunkPlan {
        self.split(request, self.chunk_cap())
    }

    /// 上下文超长后的重拆：上限减半，低于下限返回 `None`
    pub fn replan(&self, request: &ScoreRequest, previous_cap: usize) -> Option<ChunkPlan> {
        let cap = previous_cap / 2;
        if cap < self.floor {
            debug!(
                id = %request.id,
                cap,
                floor = self.floor,
                "单块上限已低于下限，停止拆分"
            );
            return None;
        }
        Some(self.split(request, cap))
    }

    /// 按给定单块上限拆分
    pub fn split(&self, request: &ScoreRequest, cap: usize) -> ChunkPlan {
        let cap = cap.max(1);
        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_cost = 0usize;

        for line in request.content.split_inclusive('\n') {
            let cost = self.estimate(line);

            if cost > cap {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                    current_cost = 0;
                }
                pieces.extend(self.hard_split(line, cap));
                continue;
            }

            if !current.is_empty() && current_cost + cost > cap {
                pieces.push(std::mem::take(&mut current));
                current_cost = 0;
            }
            current.push_str(line);
            current_cost += cost;
        }
        if !current.is_empty() || pieces.is_empty() {
            pieces.push(current);
        }

        let total = pieces.len();
        let chunks = pieces
            .into_iter()
            .enumerate()
            .map(|(idx, content)| {
                let cost = self.estimate(&content);
                ScoreRequest::new(format!("{}#{}/{}", request.id, idx + 1, total), content, cost)
            })
            .collect::<Vec<_>>();

        debug!(
            id = %request.id,
            cap,
            chunks = chunks.len(),
            "拆分完成"
        );

        ChunkPlan {
            parent_id: request.id.clone(),
            cap,
            chunks,
        }
    }

    /// 单行超长时按字符边界切开
    fn hard_split(&self, line: &str, cap: usize) -> Vec<String> {
        let chars: Vec<char> = line.chars().collect();
        let mut pieces = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let rest = chars.len() - start;
            let rest_cost = self.estimate(&chars[start..].iter().collect::<String>()).max(1);
            let mut take = (rest * cap / rest_cost).clamp(1, rest);

            loop {
                let piece: String = chars[start..start + take].iter().collect();
                if take == 1 || self.estimate(&piece) <= cap {
                    pieces.push(piece);
                    break;
                }
                take = (take * 9 / 10).max(1);
            }
            start += take;
        }
        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_with_cost(segmenter: &InputSegmenter, target: usize) -> String {
        let line = "    let total = items.iter().map(|item| item.price * item.quantity).sum::<u64>();\n";
        let mut blob = String::new();
        while segmenter.estimate(&blob) < target {
            blob.push_str(line);
        }
        blob
    }

    #[test]
    fn test_heuristic_overestimates() {
        let estimator = HeuristicEstimator;
        assert_eq!(estimator.estimate(""), 0);
        // 40 个字符按 4 字符 / token 约 10 个，启发式应更高
        assert!(estimator.estimate("fn main() { println!(\"hello world\"); }") >= 10);
    }

    #[test]
    fn test_large_blob_splits_into_bounded_chunks() {
        let segmenter = InputSegmenter::new(8_000, 250);
        let blob = blob_with_cost(&segmenter, 20_000);
        let request = segmenter.request("src/big.rs", blob.clone());
        assert!(segmenter.is_oversized(&request));

        let plan = segmenter.plan(&request);

        assert!(plan.len() >= 3, "只拆出 {} 块", plan.len());
        for chunk in &plan.chunks {
            assert!(segmenter.estimate(&chunk.content) <= 8_000);
            assert!(chunk.estimated_cost <= 8_000);
        }
        assert_eq!(plan.reassemble(), blob);
        assert_eq!(plan.chunks[0].id, format!("src/big.rs#1/{}", plan.len()));
    }

    #[test]
    fn test_chunks_keep_line_boundaries() {
        let segmenter = InputSegmenter::new(100, 10);
        let request = segmenter.request("a.rs", "first line here\n".repeat(40));
        let plan = segmenter.plan(&request);

        assert!(plan.len() > 1);
        for chunk in &plan.chunks {
            assert!(chunk.content.ends_with('\n'));
        }
    }

    #[test]
    fn test_single_long_line_is_hard_split() {
        let segmenter = InputSegmenter::new(100, 10);
        let line = "x".repeat(5_000);
        let request = segmenter.request("min.js", line.clone());
        let plan = segmenter.plan(&request);

        assert!(plan.len() > 1);
        for chunk in &plan.chunks {
            assert!(segmenter.estimate(&chunk.content) <= segmenter.chunk_cap());
        }
        assert_eq!(plan.reassemble(), line);
    }

    #[test]
    fn test_replan_halves_until_floor() {
        let segmenter = InputSegmenter::new(8_000, 1_000);
        let blob = blob_with_cost(&segmenter, 5_000);
        let request = segmenter.request("src/mid.rs", blob.clone());

        let first = segmenter.replan(&request, 8_000).unwrap();
        assert_eq!(first.cap, 4_000);
        let second = segmenter.replan(&request, first.cap).unwrap();
        assert_eq!(second.cap, 2_000);
        assert!(second.len() > first.len());
        assert_eq!(second.reassemble(), blob);

        let third = segmenter.replan(&request, second.cap).unwrap();
        assert_eq!(third.cap, 1_000);
        assert!(segmenter.replan(&request, third.cap).is_none());
    }

    /// 每个字符计 1 单位
    struct CharCount;

    impl CostEstimator for CharCount {
        fn estimate(&self, text: &str) -> usize {
            text.chars().count()
        }
    }

    #[test]
    fn test_custom_estimator_drives_costs_and_chunks() {
        let segmenter = InputSegmenter::with_estimator(100, 10, Arc::new(CharCount));
        let content = "abcdefghi\n".repeat(30);
        let request = segmenter.request("src/lines.rs", content.clone());

        assert_eq!(request.estimated_cost, 300);
        assert!(segmenter.is_oversized(&request));

        // 单块上限 75，每行 10 个字符，每块 7 行
        let plan = segmenter.plan(&request);
        assert_eq!(plan.cap, 75);
        assert_eq!(plan.len(), 5);
        assert!(plan.chunks.iter().all(|c| c.estimated_cost <= 75));
        assert_eq!(plan.chunks[0].estimated_cost, 70);
        assert_eq!(plan.reassemble(), content);
    }

    #[test]
    fn test_empty_content_yields_one_chunk() {
        let segmenter = InputSegmenter::new(100, 10);
        let plan = segmenter.plan(&ScoreRequest::new("empty", "", 0));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.reassemble(), "");
    }
}

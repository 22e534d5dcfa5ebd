//! 分块结果合并
//!
//! 把同一个超长请求各分块的评分合并成一个结果：
//! - 维度分取各块均值（四舍五入后截断）
//! - `overall` 取各块 `overall` 的均值，保留一位小数
//! - 评语保留前三条，其余只记录条数
//!
//! 降级的分块不参与平均；全部分块都降级时结果仍是降级。

use tracing::debug;

use crate::models::score::{clamp_score, round_one_decimal};
use crate::models::{Dimension, Provenance, ScoreResult};

/// 合并时最多保留的评语条数
pub const MAX_MERGED_COMMENTS: usize = 3;

pub fn merge_chunk_results(results: &[ScoreResult]) -> ScoreResult {
    let usable: Vec<&ScoreResult> = results.iter().filter(|r| !r.is_degraded()).collect();

    if usable.is_empty() {
        return ScoreResult::degraded(format!("{} 个分块全部评分失败", results.len()));
    }

    let count = usable.len() as f64;
    let mut dims = [0u8; 7];
    for dim in Dimension::ALL {
        let sum: f64 = usable.iter().map(|r| f64::from(r.get(dim))).sum();
        dims[dim.index()] = clamp_score(sum / count);
    }
    let overall = round_one_decimal(usable.iter().map(|r| r.overall).sum::<f64>() / count);

    let comments: Vec<&str> = usable
        .iter()
        .map(|r| r.commentary.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let mut commentary = comments
        .iter()
        .take(MAX_MERGED_COMMENTS)
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, c))
        .collect::<Vec<_>>()
        .join("\n");
    if comments.len() > MAX_MERGED_COMMENTS {
        commentary.push_str(&format!(
            "\n(另有 {} 条分块评语已省略)",
            comments.len() - MAX_MERGED_COMMENTS
        ));
    }
    let skipped = results.len() - usable.len();
    if skipped > 0 {
        commentary.push_str(&format!("\n({} 个分块评分失败，未计入平均)", skipped));
    }

    debug!(
        chunks = results.len(),
        usable = usable.len(),
        overall,
        "分块结果合并完成"
    );

    let mut merged =
        ScoreResult::from_dimensions(dims, Some(overall), commentary, Provenance::ChunkMerged);
    // 均值后的维度可能全同而被扰动，总分仍以各块总分均值为准
    merged.overall = overall;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(dims: [u8; 7], overall: f64, comment: &str) -> ScoreResult {
        ScoreResult::from_dimensions(dims, Some(overall), comment, Provenance::Direct)
    }

    #[test]
    fn test_overall_is_mean_of_chunk_overalls() {
        let results = vec![
            scored([6, 7, 6, 5, 6, 7, 6], 6.0, "a"),
            scored([8, 9, 8, 7, 8, 9, 8], 8.0, "b"),
            scored([7, 8, 7, 6, 7, 8, 7], 7.0, "c"),
        ];
        let merged = merge_chunk_results(&results);

        assert_eq!(merged.overall, 7.0);
        assert_eq!(merged.readability, 7);
        assert_eq!(merged.efficiency, 8);
        assert_eq!(merged.provenance, Provenance::ChunkMerged);
        assert!(merged.commentary.contains("[1] a"));
    }

    #[test]
    fn test_flat_average_keeps_chunk_overall_mean() {
        let results = vec![
            scored([6, 6, 6, 6, 6, 6, 7], 6.0, "a"),
            scored([6, 6, 6, 6, 6, 6, 5], 8.0, "b"),
        ];
        let merged = merge_chunk_results(&results);

        assert_eq!(merged.overall, 7.0);
        let dims = merged.dimensions();
        assert!(dims.iter().any(|&d| d != dims[0]));
        assert!(dims.iter().all(|&d| (1..=10).contains(&d)));
    }

    #[test]
    fn test_commentary_keeps_first_three() {
        let results: Vec<_> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|c| scored([6, 7, 6, 5, 6, 7, 6], 6.2, c))
            .collect();
        let merged = merge_chunk_results(&results);

        assert!(merged.commentary.contains("[3] c"));
        assert!(!merged.commentary.contains("[4] d"));
        assert!(merged.commentary.contains("另有 2 条"));
    }

    #[test]
    fn test_degraded_chunks_are_excluded() {
        let results = vec![
            scored([8, 9, 8, 7, 8, 9, 8], 8.4, "good"),
            ScoreResult::degraded("timeout"),
        ];
        let merged = merge_chunk_results(&results);

        assert_eq!(merged.overall, 8.4);
        assert_eq!(merged.readability, 8);
        assert!(!merged.is_degraded());
    }

    #[test]
    fn test_all_degraded_stays_degraded() {
        let results = vec![ScoreResult::degraded("x"), ScoreResult::degraded("y")];
        let merged = merge_chunk_results(&results);
        assert!(merged.is_degraded());
        assert_eq!(merged.overall, 5.0);
    }
}

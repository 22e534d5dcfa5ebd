//! 评分提示词构建
//!
//! 只负责拼装发送给评分服务的系统消息和用户消息。

use crate::models::Dimension;

/// 系统消息：约定七个维度与 JSON 输出格式
pub fn system_prompt() -> String {
    let fields = Dimension::ALL
        .iter()
        .map(|dim| format!("  \"{}\": <1-10>", dim.key()))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        r#"You are an experienced software engineer reviewing code changes.
Rate the diff on each dimension with an integer from 1 (poor) to 10 (excellent).
Be discriminating: different dimensions usually deserve different scores.

Respond with a single JSON object and nothing else:
{{
{},
  "overall_score": <1.0-10.0>,
  "comments": "<short justification>"
}}"#,
        fields
    )
}

/// 用户消息
///
/// # 参数
/// - `label`: 请求的可读标识（例如文件路径）
/// - `content`: diff 文本
/// - `part`: 分块时的 `(序号, 总数)`，序号从 1 开始
pub fn user_prompt(label: &str, content: &str, part: Option<(usize, usize)>) -> String {
    let header = match part {
        Some((index, total)) if total > 1 => format!(
            "Review part {} of {} of the change to `{}`. \
             Score only what is visible in this part.",
            index, total, label
        ),
        _ => format!("Review the change to `{}`.", label),
    };

    format!("{}\n\n```diff\n{}\n```", header, content.trim_end())
}

/// 从分块 id (`path#2/5`) 中取出序号和总数
pub fn chunk_position(id: &str) -> Option<(&str, usize, usize)> {
    let (parent, position) = id.rsplit_once('#')?;
    let (index, total) = position.split_once('/')?;
    Some((parent, index.parse().ok()?, total.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_lists_every_dimension() {
        let prompt = system_prompt();
        for dim in Dimension::ALL {
            assert!(prompt.contains(dim.key()), "缺少维度 {}", dim.key());
        }
        assert!(prompt.contains("overall_score"));
    }

    #[test]
    fn test_user_prompt_mentions_part() {
        let prompt = user_prompt("src/lib.rs", "+fn a() {}\n", Some((2, 3)));
        assert!(prompt.starts_with("Review part 2 of 3"));
        assert!(prompt.contains("+fn a() {}"));

        let whole = user_prompt("src/lib.rs", "+fn a() {}\n", None);
        assert!(whole.starts_with("Review the change to `src/lib.rs`"));
    }

    #[test]
    fn test_chunk_position() {
        assert_eq!(chunk_position("src/a.rs#2/5"), Some(("src/a.rs", 2, 5)));
        assert_eq!(chunk_position("src/a.rs#2/5#1/2"), Some(("src/a.rs#2/5", 1, 2)));
        assert_eq!(chunk_position("src/a.rs"), None);
    }
}

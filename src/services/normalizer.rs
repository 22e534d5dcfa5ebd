//! 响应规范化服务 - 业务能力层
//!
//! 只负责"把评分服务的自由文本回复转换成固定结构"能力。
//!
//! ## 提取策略（按顺序，先成功者胜出）
//!
//! 1. 代码围栏中的 JSON 对象
//! 2. 文本中任意包含预期字段的 `{...}` 对象
//! 3. `SCORES` 段落中的"标签: 数值"列表，逐字段重建
//! 4. 第一个 `{` 到最后一个 `}` 之间的内容，做简单修复后解析
//!
//! 全部失败时返回降级默认结果。解析失败不会重试，重试只发生在网络调用层。

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::score::{clamp_overall, clamp_score, round_one_decimal};
use crate::models::{Dimension, Provenance, ScoreResult, NEUTRAL_SCORE};
use crate::utils::logging::truncate_text;

/// `overall` 的别名（已规范化）
const OVERALL_ALIASES: &[&str] = &["overall", "total", "final", "average", "score"];
/// 评语的别名（已规范化）
const COMMENTARY_ALIASES: &[&str] = &[
    "comments",
    "comment",
    "commentary",
    "summary",
    "feedback",
    "analysis",
    "explanation",
    "review",
    "notes",
    "reasoning",
];
/// 可能包裹分数的嵌套字段
const NESTED_ALIASES: &[&str] = &["scores", "score", "ratings", "evaluation"];
/// 最多尝试解析的 `{` 位置数
const MAX_OBJECT_CANDIDATES: usize = 64;

/// 成功提取时使用的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FencedBlock,
    EmbeddedObject,
    ScoresSection,
    BraceSpan,
}

/// 响应规范化服务
pub struct ResponseNormalizer {
    fenced_block: Regex,
    scores_header: Regex,
    labeled_value: Regex,
    labeled_comment: Regex,
    trailing_comma: Regex,
}

impl ResponseNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            fenced_block: Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)```")?,
            scores_header: Regex::new(r"(?im)^[\s#>*_\-]*scores?[\s*_]*[:：]?[\s*_]*$|(?i)\bSCORES\s*[:：]")?,
            labeled_value: Regex::new(
                r"(?m)^[\s>*\-•#\d.)]*\**\s*([A-Za-z][A-Za-z _\-]*?)\s*\**\s*[:=：]\s*\**\s*(-?\d+(?:\.\d+)?)(?:\s*/\s*(\d+))?",
            )?,
            labeled_comment: Regex::new(
                r"(?ims)^[\s>*\-•#]*\**\s*(?:comments?|commentary|summary|feedback)\s*\**\s*[:=：]\s*(.+)",
            )?,
            trailing_comma: Regex::new(r",\s*([}\]])")?,
        })
    }

    /// 规范化一次原始回复
    pub fn normalize(&self, raw: &str) -> ScoreResult {
        match self.extract(raw) {
            Some((strategy, result)) => {
                debug!(?strategy, overall = result.overall, "评分响应解析成功");
                result
            }
            None => {
                warn!("无法解析评分响应，使用默认评分: {}", truncate_text(raw.trim(), 120));
                ScoreResult::degraded(format!(
                    "无法从评分响应中解析出结构化分数 (parse failure)，原始回复: {}",
                    truncate_text(raw.trim(), 200)
                ))
            }
        }
    }

    /// 依次尝试各提取策略
    pub fn extract(&self, raw: &str) -> Option<(Strategy, ScoreResult)> {
        if let Some(result) = self.from_fenced_block(raw) {
            return Some((Strategy::FencedBlock, result));
        }
        if let Some(result) = self.from_embedded_object(raw) {
            return Some((Strategy::EmbeddedObject, result));
        }
        if let Some(result) = self.from_scores_section(raw) {
            return Some((Strategy::ScoresSection, result));
        }
        if let Some(result) = self.from_brace_span(raw) {
            return Some((Strategy::BraceSpan, result));
        }
        None
    }

    fn from_fenced_block(&self, raw: &str) -> Option<ScoreResult> {
        self.fenced_block.captures_iter(raw).find_map(|caps| {
            let body = caps.get(1)?.as_str();
            let start = body.find('{')?;
            let object = first_object(&body[start..]).or_else(|| {
                let end = body.rfind('}')?;
                self.parse_repaired(&body[start..=end])
            })?;
            normalize_object(&object)
        })
    }

    fn from_embedded_object(&self, raw: &str) -> Option<ScoreResult> {
        raw.match_indices('{')
            .take(MAX_OBJECT_CANDIDATES)
            .find_map(|(idx, _)| {
                let object = first_object(&raw[idx..])?;
                if !has_expected_keys(&object) {
                    return None;
                }
                normalize_object(&object)
            })
    }

    fn from_scores_section(&self, raw: &str) -> Option<ScoreResult> {
        let header = self.scores_header.find(raw)?;
        let section = &raw[header.end()..];

        let mut object = Map::new();
        for caps in self.labeled_value.captures_iter(section) {
            let (Some(label), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let Ok(mut number) = value.as_str().parse::<f64>() else {
                continue;
            };
            if let Some(denominator) = caps.get(3).and_then(|d| d.as_str().parse::<f64>().ok()) {
                number = rescale(number, denominator);
            }
            let key = label.as_str().trim().to_string();
            if !object.contains_key(&key) {
                object.insert(key, Value::from(number));
            }
        }

        if let Some(comment) = self
            .labeled_comment
            .captures(section)
            .or_else(|| self.labeled_comment.captures(raw))
            .and_then(|caps| caps.get(1))
        {
            object.insert("comments".to_string(), Value::from(comment.as_str().trim()));
        }

        normalize_object(&object)
    }

    fn from_brace_span(&self, raw: &str) -> Option<ScoreResult> {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end <= start {
            return None;
        }
        let object = self.parse_repaired(&raw[start..=end])?;
        normalize_object(&object)
    }

    /// 修复常见的非标准 JSON：尾随逗号、智能引号、单引号
    fn parse_repaired(&self, text: &str) -> Option<Map<String, Value>> {
        let mut repaired = text
            .replace(['\u{201c}', '\u{201d}'], "\"")
            .replace(['\u{2018}', '\u{2019}'], "'");
        repaired = self.trailing_comma.replace_all(&repaired, "$1").into_owned();
        if !repaired.contains('"') {
            repaired = repaired.replace('\'', "\"");
        }

        match serde_json::from_str::<Value>(&repaired) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// 从文本开头流式解析出第一个 JSON 值，要求是对象
fn first_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()?
    {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// 去掉分隔符、转小写，并去掉 `_score` 之类的后缀
fn canonical_key(key: &str) -> String {
    let flat: String = key
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    match flat.strip_suffix("score") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => flat,
    }
}

fn dimension_for(canonical: &str) -> Option<Dimension> {
    Dimension::ALL
        .into_iter()
        .find(|dim| dim.aliases().contains(&canonical))
}

fn has_expected_keys(object: &Map<String, Value>) -> bool {
    object.keys().any(|key| {
        let canonical = canonical_key(key);
        dimension_for(&canonical).is_some()
            || OVERALL_ALIASES.contains(&canonical.as_str())
            || NESTED_ALIASES.contains(&canonical.as_str())
    })
}

/// 把 `8/10`、`4/5` 之类换算到十分制
fn rescale(value: f64, denominator: f64) -> f64 {
    if denominator > 0.0 && denominator != 10.0 {
        value / denominator * 10.0
    } else {
        value
    }
}

/// 把各种形态的值强制转换为数字
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_numeric_text(s),
        Value::Object(map) => map.iter().find_map(|(k, v)| {
            matches!(canonical_key(k).as_str(), "score" | "value" | "rating")
                .then(|| coerce_number(v))
                .flatten()
        }),
        _ => None,
    }
}

fn parse_numeric_text(text: &str) -> Option<f64> {
    let text = text.trim();
    let (numerator, denominator) = match text.split_once('/') {
        Some((n, d)) => (n.trim(), Some(d.trim())),
        None => (text, None),
    };
    let numeric: String = numerator
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let value = numeric.parse::<f64>().ok()?;
    match denominator.and_then(|d| d.parse::<f64>().ok()) {
        Some(d) => Some(rescale(value, d)),
        None => Some(value),
    }
}

fn commentary_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

/// 把一个 JSON 对象映射到七个规范维度
///
/// 既没有任何维度也没有 `overall` 时返回 `None`，交给下一个策略。
fn normalize_object(object: &Map<String, Value>) -> Option<ScoreResult> {
    // 嵌套在 score / scores 下的字段优先
    let mut view: Vec<(String, &Value)> = Vec::new();
    for (key, value) in object {
        let canonical = canonical_key(key);
        if NESTED_ALIASES.contains(&canonical.as_str()) {
            if let Value::Object(inner) = value {
                view.extend(inner.iter().map(|(k, v)| (canonical_key(k), v)));
            }
        }
    }
    view.extend(object.iter().map(|(k, v)| (canonical_key(k), v)));

    let mut dims: [Option<f64>; 7] = [None; 7];
    let mut overall = None;
    let mut commentary = None;

    for (canonical, value) in &view {
        if let Some(dim) = dimension_for(canonical) {
            let slot = &mut dims[dim.index()];
            if slot.is_none() {
                *slot = coerce_number(value);
            }
        } else if OVERALL_ALIASES.contains(&canonical.as_str()) {
            if overall.is_none() {
                overall = coerce_number(value);
            }
        } else if COMMENTARY_ALIASES.contains(&canonical.as_str()) && commentary.is_none() {
            commentary = commentary_text(value);
        }
    }

    let present: Vec<f64> = dims.iter().flatten().copied().filter(|v| v.is_finite()).collect();
    if present.is_empty() && overall.is_none() {
        return None;
    }

    let scores = dims.map(|v| v.map(clamp_score).unwrap_or(NEUTRAL_SCORE));
    let overall = overall.filter(|v| v.is_finite()).map(clamp_overall).or_else(|| {
        if present.is_empty() {
            return None;
        }
        let clamped: Vec<f64> = present.iter().map(|&v| f64::from(clamp_score(v))).collect();
        Some(round_one_decimal(clamped.iter().sum::<f64>() / clamped.len() as f64))
    });

    Some(ScoreResult::from_dimensions(
        scores,
        overall,
        commentary.unwrap_or_default(),
        Provenance::Direct,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> ResponseNormalizer {
        ResponseNormalizer::new().unwrap()
    }

    #[test]
    fn test_canonical_flat_json_is_unchanged() {
        let raw = r#"{"readability":8,"efficiency":7,"security":9,"structure":7,"error_handling":6,"documentation":8,"code_style":8,"overall_score":7.6,"comments":"ok"}"#;
        let result = normalizer().normalize(raw);

        assert_eq!(result.dimensions(), [8, 7, 9, 7, 6, 8, 8]);
        assert_eq!(result.overall, 7.6);
        assert_eq!(result.commentary, "ok");
        assert_eq!(result.provenance, Provenance::Direct);
    }

    #[test]
    fn test_fenced_block_with_prose() {
        let raw = "Here is my review.\n```json\n{\n  \"readability\": 9,\n  \"efficiency\": 6,\n  \"security\": 7,\n  \"structure\": 8,\n  \"error_handling\": 5,\n  \"documentation\": 4,\n  \"code_style\": 9,\n  \"comments\": \"Solid change.\"\n}\n```\nThanks!";
        let (strategy, result) = normalizer().extract(raw).unwrap();

        assert_eq!(strategy, Strategy::FencedBlock);
        assert_eq!(result.readability, 9);
        assert_eq!(result.documentation, 4);
        // 48 / 7 = 6.857
        assert_eq!(result.overall, 6.9);
        assert_eq!(result.commentary, "Solid change.");
    }

    #[test]
    fn test_nested_and_per_field_objects() {
        let raw = r#"Result: {"score": {"readability": {"score": 7}, "efficiency": "8/10", "security": 6, "structure": 7, "errorHandling": 9, "documentation": 5, "codeStyle": 8}, "overall": 7.1, "summary": "fine"}"#;
        let (strategy, result) = normalizer().extract(raw).unwrap();

        assert_eq!(strategy, Strategy::EmbeddedObject);
        assert_eq!(result.dimensions(), [7, 8, 6, 7, 9, 5, 8]);
        assert_eq!(result.overall, 7.1);
        assert_eq!(result.commentary, "fine");
    }

    #[test]
    fn test_alternate_names_and_missing_fields() {
        let raw = r#"{"code_readability": 8, "performance": 6, "Error-Handling": 4, "readability_score": 2}"#;
        let result = normalizer().normalize(raw);

        assert_eq!(result.readability, 8);
        assert_eq!(result.efficiency, 6);
        assert_eq!(result.error_handling, 4);
        // 缺失维度取中性分
        assert_eq!(result.security, NEUTRAL_SCORE);
        assert_eq!(result.code_style, NEUTRAL_SCORE);
        // overall 取已给出维度的均值: (8 + 6 + 4) / 3
        assert_eq!(result.overall, 6.0);
        assert_eq!(result.commentary, "");
    }

    #[test]
    fn test_scores_section() {
        let raw = "I looked at the diff carefully.\n\nSCORES:\n- Readability: 8\n- Efficiency: 7\n- Security: 9/10\n- Structure: 6\n- Error Handling: 5\n- Documentation: 4\n- Code Style: 7\n- Overall: 6.8\n\nComments: Consider adding tests.\n";
        let (strategy, result) = normalizer().extract(raw).unwrap();

        assert_eq!(strategy, Strategy::ScoresSection);
        assert_eq!(result.dimensions(), [8, 7, 9, 6, 5, 4, 7]);
        assert_eq!(result.overall, 6.8);
        assert_eq!(result.commentary, "Consider adding tests.");
    }

    #[test]
    fn test_brace_span_repairs_trailing_commas() {
        let raw = "Scores follow {'readability': 7, 'efficiency': 8, 'security': 6, 'structure': 7, 'error_handling': 8, 'documentation': 6, 'code_style': 9,} end";
        let (strategy, result) = normalizer().extract(raw).unwrap();

        assert_eq!(strategy, Strategy::BraceSpan);
        assert_eq!(result.code_style, 9);
        assert_eq!(result.efficiency, 8);
    }

    #[test]
    fn test_values_are_clamped() {
        let raw = r#"{"readability": 14, "efficiency": -2, "security": "seven", "structure": 7, "error_handling": 7, "documentation": 7, "code_style": 7, "overall": 42}"#;
        let result = normalizer().normalize(raw);

        assert_eq!(result.readability, 10);
        assert_eq!(result.efficiency, 1);
        assert_eq!(result.security, NEUTRAL_SCORE);
        assert_eq!(result.overall, 10.0);
    }

    #[test]
    fn test_no_structure_returns_degraded_default() {
        let raw = "I'm sorry, I cannot review this change right now.";
        let result = normalizer().normalize(raw);

        assert_eq!(result.dimensions(), [NEUTRAL_SCORE; 7]);
        assert_eq!(result.overall, 5.0);
        assert_eq!(result.provenance, Provenance::Degraded);
        assert!(!result.commentary.is_empty());
        assert!(result.commentary.contains("parse failure"));
    }

    #[test]
    fn test_object_without_expected_keys_is_rejected() {
        let raw = r#"{"status": "ok", "items": [1, 2, 3]}"#;
        let result = normalizer().normalize(raw);
        assert!(result.is_degraded());
    }

    #[test]
    fn test_identical_scores_are_perturbed() {
        let raw = r#"{"readability":6,"efficiency":6,"security":6,"structure":6,"error_handling":6,"documentation":6,"code_style":6,"overall_score":6.0,"comments":"flat"}"#;
        let result = normalizer().normalize(raw);

        let dims = result.dimensions();
        assert!(dims.iter().any(|&d| d != dims[0]));
        assert_eq!(result.overall, result.dimension_mean());
        assert!(result.overall >= 1.0 && result.overall <= 10.0);
    }
}

use serde::{Deserialize, Serialize};

/// 维度分数下限
pub const MIN_SCORE: u8 = 1;
/// 维度分数上限
pub const MAX_SCORE: u8 = 10;
/// 缺失维度使用的中性分
pub const NEUTRAL_SCORE: u8 = 5;

/// 评分维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Readability,
    Efficiency,
    Security,
    Structure,
    ErrorHandling,
    Documentation,
    CodeStyle,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Readability,
        Dimension::Efficiency,
        Dimension::Security,
        Dimension::Structure,
        Dimension::ErrorHandling,
        Dimension::Documentation,
        Dimension::CodeStyle,
    ];

    /// 规范字段名
    pub fn key(self) -> &'static str {
        match self {
            Dimension::Readability => "readability",
            Dimension::Efficiency => "efficiency",
            Dimension::Security => "security",
            Dimension::Structure => "structure",
            Dimension::ErrorHandling => "error_handling",
            Dimension::Documentation => "documentation",
            Dimension::CodeStyle => "code_style",
        }
    }

    /// 历史上出现过的别名（已去掉分隔符并转为小写）
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Dimension::Readability => &["readability", "codereadability", "clarity"],
            Dimension::Efficiency => &["efficiency", "performance", "codeefficiency"],
            Dimension::Security => &["security", "codesecurity", "safety"],
            Dimension::Structure => &["structure", "codestructure", "architecture", "design"],
            Dimension::ErrorHandling => &["errorhandling", "errors", "robustness"],
            Dimension::Documentation => &["documentation", "docs", "commentsquality"],
            Dimension::CodeStyle => &["codestyle", "style", "formatting"],
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// 单次调用直接得到
    Direct,
    /// 多个分块结果合并得到
    ChunkMerged,
    /// 无法正常评估时的默认结果
    Degraded,
}

/// 单个文件 diff 的评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub readability: u8,
    pub efficiency: u8,
    pub security: u8,
    pub structure: u8,
    pub error_handling: u8,
    pub documentation: u8,
    pub code_style: u8,
    pub overall: f64,
    pub commentary: String,
    pub provenance: Provenance,
}

impl ScoreResult {
    /// 由七个维度构建结果
    ///
    /// - 所有维度都会被截断到 [1, 10]
    /// - `overall` 缺失时取维度均值（保留一位小数）
    /// - 七个维度完全相同时施加确定性扰动，并重新计算 `overall`
    pub fn from_dimensions(
        dims: [u8; 7],
        overall: Option<f64>,
        commentary: impl Into<String>,
        provenance: Provenance,
    ) -> Self {
        let mut result = Self {
            readability: NEUTRAL_SCORE,
            efficiency: NEUTRAL_SCORE,
            security: NEUTRAL_SCORE,
            structure: NEUTRAL_SCORE,
            error_handling: NEUTRAL_SCORE,
            documentation: NEUTRAL_SCORE,
            code_style: NEUTRAL_SCORE,
            overall: f64::from(NEUTRAL_SCORE),
            commentary: commentary.into(),
            provenance,
        };
        for dim in Dimension::ALL {
            result.set(dim, dims[dim.index()].clamp(MIN_SCORE, MAX_SCORE));
        }
        result.overall = match overall.filter(|v| v.is_finite()) {
            Some(value) => clamp_overall(value),
            None => result.dimension_mean(),
        };
        result.finalize();
        result
    }

    /// 降级默认结果：全部中性分，说明失败原因
    pub fn degraded(reason: impl AsRef<str>) -> Self {
        Self {
            readability: NEUTRAL_SCORE,
            efficiency: NEUTRAL_SCORE,
            security: NEUTRAL_SCORE,
            structure: NEUTRAL_SCORE,
            error_handling: NEUTRAL_SCORE,
            documentation: NEUTRAL_SCORE,
            code_style: NEUTRAL_SCORE,
            overall: f64::from(NEUTRAL_SCORE),
            commentary: format!("评分降级为默认值: {}", reason.as_ref()),
            provenance: Provenance::Degraded,
        }
    }

    pub fn get(&self, dim: Dimension) -> u8 {
        match dim {
            Dimension::Readability => self.readability,
            Dimension::Efficiency => self.efficiency,
            Dimension::Security => self.security,
            Dimension::Structure => self.structure,
            Dimension::ErrorHandling => self.error_handling,
            Dimension::Documentation => self.documentation,
            Dimension::CodeStyle => self.code_style,
        }
    }

    fn set(&mut self, dim: Dimension, value: u8) {
        let slot = match dim {
            Dimension::Readability => &mut self.readability,
            Dimension::Efficiency => &mut self.efficiency,
            Dimension::Security => &mut self.security,
            Dimension::Structure => &mut self.structure,
            Dimension::ErrorHandling => &mut self.error_handling,
            Dimension::Documentation => &mut self.documentation,
            Dimension::CodeStyle => &mut self.code_style,
        };
        *slot = value;
    }

    pub fn dimensions(&self) -> [u8; 7] {
        Dimension::ALL.map(|dim| self.get(dim))
    }

    /// 七个维度的均值（保留一位小数）
    pub fn dimension_mean(&self) -> f64 {
        let sum: u32 = self.dimensions().iter().map(|&v| u32::from(v)).sum();
        round_one_decimal(f64::from(sum) / 7.0)
    }

    pub fn is_degraded(&self) -> bool {
        self.provenance == Provenance::Degraded
    }

    fn is_flat(&self) -> bool {
        let dims = self.dimensions();
        dims.iter().all(|&v| v == dims[0])
    }

    /// 全部维度相同时的兼容处理
    ///
    /// 对固定的三个维度做 ±1 扰动（越界则取反方向），随后按维度均值重算 `overall`。
    // TODO: 确认上游是否在模型打分失败时才返回全同分数，若是则应降级而不是扰动
    fn finalize(&mut self) {
        if !self.is_flat() {
            return;
        }
        let base = i16::from(self.readability);
        let shifts = [
            (Dimension::Readability, 1i16),
            (Dimension::Efficiency, -1),
            (Dimension::Documentation, 1),
        ];
        for (dim, delta) in shifts {
            let mut value = base + delta;
            if !(i16::from(MIN_SCORE)..=i16::from(MAX_SCORE)).contains(&value) {
                value = base - delta;
            }
            // 上面已保证落在 [1, 10]
            self.set(dim, value as u8);
        }
        self.overall = self.dimension_mean();
    }
}

/// 将任意数值强制转换为合法维度分
pub fn clamp_score(value: f64) -> u8 {
    if !value.is_finite() {
        return NEUTRAL_SCORE;
    }
    value
        .round()
        .clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE)) as u8
}

/// 将 overall 截断到 [1.0, 10.0]
pub fn clamp_overall(value: f64) -> f64 {
    if !value.is_finite() {
        return f64::from(NEUTRAL_SCORE);
    }
    value.clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE))
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

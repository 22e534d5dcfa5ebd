//! 日志工具模块
//!
//! 提供日志初始化、格式化和输出的辅助函数

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// 初始化日志
///
/// 优先使用 `RUST_LOG`，未设置时默认 `info`（详细模式为 `debug`）。
/// 重复初始化（例如在测试中）会被忽略。
///
/// # 参数
/// - `verbose`: 是否输出详细日志
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 全局配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 代码变更批量评分模式");
    info!(
        "启动时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("🤖 模型: {}", config.llm_model_name);
    info!("📊 最大并发数: {}", config.max_concurrency);
    info!("⏱️ 速率上限: {} 单位/分钟", config.rate_per_minute);
    info!(
        "✂️ 单次输入上限: {} 单位 (最小分块 {})",
        config.chunk_size_ceiling, config.chunk_floor
    );
    info!("💾 结果缓存: {}", if config.cache_enabled { "开启" } else { "关闭" });
    info!("{}", "=".repeat(60));
}

/// 记录提交加载信息
///
/// # 参数
/// - `commits`: 提交数量
/// - `files`: 文件 diff 总数
pub fn log_commits_loaded(commits: usize, files: usize) {
    info!("✓ 找到 {} 个待评分的提交，共 {} 个文件 diff", commits, files);
}

/// 记录波次开始信息
///
/// # 参数
/// - `wave_num`: 波次编号
/// - `size`: 本波请求数
/// - `done`: 已派发的请求数
/// - `total`: 请求总数
pub fn log_wave_start(wave_num: usize, size: usize, done: usize, total: usize) {
    info!("{}", "─".repeat(60));
    info!(
        "📦 开始第 {} 波: 请求 {}-{} / 共 {} 个",
        wave_num,
        done + 1,
        done + size,
        total
    );
}

/// 记录波次完成信息
///
/// # 参数
/// - `wave_num`: 波次编号
/// - `finished`: 正常结束的任务数
/// - `size`: 本波请求数
pub fn log_wave_complete(wave_num: usize, finished: usize, size: usize) {
    info!("✓ 第 {} 波完成: {}/{}", wave_num, finished, size);
}

/// 最终统计数据
#[derive(Debug, Default, Clone, Copy)]
pub struct FinalStats {
    pub commits: usize,
    pub files: usize,
    pub direct: usize,
    pub merged: usize,
    pub degraded: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    pub rate_limit_incidents: u32,
    pub average_overall: Option<f64>,
}

/// 打印最终统计信息
///
/// # 参数
/// - `stats`: 汇总统计
pub fn print_final_stats(stats: &FinalStats) {
    info!("{}", "=".repeat(60));
    info!("📊 全部评分完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("📁 提交: {}，文件: {}", stats.commits, stats.files);
    info!("✅ 直接评分: {}", stats.direct);
    info!("🧩 分块合并: {}", stats.merged);
    info!("❌ 降级: {}", stats.degraded);
    if stats.cancelled > 0 {
        info!("⏹️ 取消未评: {}", stats.cancelled);
    }
    let scored = stats.direct + stats.merged + stats.degraded;
    let hit_rate = if scored == 0 {
        0.0
    } else {
        stats.cache_hits as f64 / scored as f64 * 100.0
    };
    info!("💾 缓存命中: {} ({:.1}%)", stats.cache_hits, hit_rate);
    info!("⚠️ 限流次数: {}", stats.rate_limit_incidents);
    if let Some(avg) = stats.average_overall {
        info!("⭐ 平均总分: {:.1}", avg);
    }
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("短文本", 10), "短文本");
        assert_eq!(truncate_text("一二三四五六", 3), "一二三...");
    }
}

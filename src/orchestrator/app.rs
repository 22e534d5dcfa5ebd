//! 应用入口 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：校验配置、打印启动信息、创建评分服务与评分器
//! 2. **批量加载**：从 diff 来源加载所有提交
//! 3. **逐个评分**：每个提交交给 `Evaluator`，提交之间共享控制器和缓存
//! 4. **全局统计**：汇总所有提交的结果

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{DiffSource, DirectoryDiffSource};
use crate::orchestrator::batch_scheduler::CancelHandle;
use crate::orchestrator::evaluator::{CommitReport, Evaluator};
use crate::services::LlmService;
use crate::utils::logging::{log_commits_loaded, log_startup, print_final_stats, FinalStats};

/// 应用主结构
pub struct App {
    evaluator: Evaluator,
    source: Box<dyn DiffSource>,
    cancel: CancelHandle,
}

impl App {
    /// 初始化应用
    pub fn initialize(config: Config) -> Result<Self> {
        config.validate().context("配置校验失败")?;
        log_startup(&config);

        let scorer = Arc::new(LlmService::new(&config));
        let evaluator = Evaluator::new(scorer, &config).context("创建评分器失败")?;
        let source = Box::new(DirectoryDiffSource::new(&config.diff_folder));

        Ok(Self::with_parts(evaluator, source))
    }

    /// 使用自定义评分器和 diff 来源
    pub fn with_parts(evaluator: Evaluator, source: Box<dyn DiffSource>) -> Self {
        Self {
            evaluator,
            source,
            cancel: CancelHandle::new(),
        }
    }

    /// 取消句柄：取消后不再评分新的提交和波次
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<Vec<CommitReport>> {
        info!("\n📁 正在扫描待评分的 diff...");
        let commits = self
            .source
            .load_commits()
            .await
            .context("加载 diff 失败")?;

        if commits.is_empty() {
            warn!("⚠️ 没有找到待评分的 diff 文件，程序结束");
            return Ok(Vec::new());
        }

        let total_files = commits.iter().map(|c| c.files.len()).sum();
        log_commits_loaded(commits.len(), total_files);

        let mut reports = Vec::with_capacity(commits.len());
        for commit in &commits {
            if self.cancel.is_cancelled() {
                warn!("⏹️ 已取消，跳过剩余提交");
                break;
            }
            reports.push(
                self.evaluator
                    .evaluate_commit_with_cancel(commit, &self.cancel)
                    .await,
            );
        }

        print_final_stats(&final_stats(&reports, total_files));
        let snapshot = self.evaluator.controller().snapshot();
        info!(
            "⏱️ 最终速率 {:.0} 单位/分钟，并发上限 {}",
            snapshot.rate_per_minute, snapshot.concurrency_ceiling
        );

        Ok(reports)
    }
}

fn final_stats(reports: &[CommitReport], files: usize) -> FinalStats {
    let mut stats = FinalStats {
        commits: reports.len(),
        files,
        ..Default::default()
    };
    for report in reports {
        let summary = &report.summary;
        stats.direct += summary.direct;
        stats.merged += summary.merged;
        stats.degraded += summary.degraded;
        stats.cancelled += summary.cancelled;
        stats.cache_hits += summary.cache_hits;
        stats.rate_limit_incidents += summary.rate_limit_incidents;
    }
    if !reports.is_empty() {
        let sum: f64 = reports.iter().map(|r| r.overall).sum();
        stats.average_overall = Some(sum / reports.len() as f64);
    }
    stats
}

//! 批量评分器 - 编排层
//!
//! ## 职责
//!
//! 对外的评分入口：接收一批 (id, content)，返回与输入同序的结果和汇总统计。
//!
//! ## 核心功能
//!
//! 1. **批内去重**：内容相同的请求只评分一次，其余复用结果并计为缓存命中
//! 2. **分波派发**：委托 `BatchScheduler`，每个请求交给 `EvaluationFlow`
//! 3. **结果汇总**：统计直接评分、分块合并、降级、缓存命中、限流和取消
//! 4. **提交聚合**：一个提交的全部文件结果合并为 `CommitReport`
//!
//! 单个请求失败不会中断批次：除取消未派发的请求外，结果数等于请求数。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{RateController, ResultMemo};
use crate::models::score::round_one_decimal;
use crate::models::{CommitDiff, CommitMeta, Dimension, Provenance, ScoreRequest, ScoreResult, NEUTRAL_SCORE};
use crate::orchestrator::batch_scheduler::{BatchScheduler, CancelHandle, SchedulerConfig, Slot};
use crate::services::llm_service::ScoringCapability;
use crate::services::normalizer::ResponseNormalizer;
use crate::services::segmenter::InputSegmenter;
use crate::workflow::{EvaluationFlow, RequestCtx, RetryPolicy};

/// 单个请求的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct ScoredItem {
    pub id: String,
    pub result: ScoreResult,
    pub from_cache: bool,
}

/// 批次汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    /// 请求总数
    pub total: usize,
    /// 产生结果的请求数
    pub scored: usize,
    pub direct: usize,
    pub merged: usize,
    pub degraded: usize,
    pub cache_hits: usize,
    pub cache_hit_rate: f64,
    /// 实际发出的评分调用次数
    pub calls: u32,
    pub rate_limit_incidents: u32,
    /// 取消后未派发的请求数
    pub cancelled: usize,
    pub elapsed: Duration,
}

/// 批次报告
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// 按输入顺序排列
    pub items: Vec<ScoredItem>,
    pub summary: BatchSummary,
}

/// 单个提交的评分报告
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub meta: CommitMeta,
    pub files: Vec<ScoredItem>,
    /// 按 [`Dimension::ALL`] 顺序排列的维度均值
    pub dimension_means: [f64; 7],
    pub overall: f64,
    pub summary: BatchSummary,
}

impl CommitReport {
    pub fn mean(&self, dim: Dimension) -> f64 {
        self.dimension_means[dim.index()]
    }
}

/// 批量评分器
pub struct Evaluator {
    flow: EvaluationFlow,
    scheduler: BatchScheduler,
    controller: RateController,
    memo: ResultMemo,
}

impl Evaluator {
    /// 使用独立的控制器和缓存创建评分器
    pub fn new(scorer: Arc<dyn ScoringCapability>, config: &Config) -> AppResult<Self> {
        Self::with_shared(
            scorer,
            config,
            RateController::from_config(config),
            ResultMemo::new(),
        )
    }

    /// 使用外部传入的控制器和缓存（可在多个评分器之间共享）
    ///
    /// 配置不合法时返回 [`AppError::Config`](crate::error::AppError::Config)
    pub fn with_shared(
        scorer: Arc<dyn ScoringCapability>,
        config: &Config,
        controller: RateController,
        memo: ResultMemo,
    ) -> AppResult<Self> {
        config.validate()?;
        let flow = EvaluationFlow::new(
            scorer,
            controller.clone(),
            memo.clone(),
            InputSegmenter::from_config(config),
            Arc::new(ResponseNormalizer::new()?),
            config.max_concurrency,
            RetryPolicy::from_config(config),
            config.cache_enabled,
        );
        let scheduler =
            BatchScheduler::new(controller.clone(), SchedulerConfig::from_config(config));

        Ok(Self {
            flow,
            scheduler,
            controller,
            memo,
        })
    }

    pub fn controller(&self) -> &RateController {
        &self.controller
    }

    pub fn memo(&self) -> &ResultMemo {
        &self.memo
    }

    /// 构建带估算额度的请求
    pub fn request(&self, id: impl Into<String>, content: impl Into<String>) -> ScoreRequest {
        self.flow.segmenter().request(id, content)
    }

    pub async fn evaluate_batch(&self, requests: Vec<ScoreRequest>) -> BatchReport {
        self.evaluate_batch_with_cancel(requests, &CancelHandle::new())
            .await
    }

    pub async fn evaluate_batch_with_cancel(
        &self,
        requests: Vec<ScoreRequest>,
        cancel: &CancelHandle,
    ) -> BatchReport {
        self.run_batch("批次", requests, cancel).await
    }

    pub async fn evaluate_commit(&self, commit: &CommitDiff) -> CommitReport {
        self.evaluate_commit_with_cancel(commit, &CancelHandle::new())
            .await
    }

    /// 评分一个提交的全部文件
    ///
    /// 维度均值和总分只统计未降级的文件；全部降级时退回所有文件。
    pub async fn evaluate_commit_with_cancel(
        &self,
        commit: &CommitDiff,
        cancel: &CancelHandle,
    ) -> CommitReport {
        info!(
            "📝 评分提交 {} ({} 个文件): {}",
            commit.short_hash(),
            commit.files.len(),
            commit.meta.message
        );

        let requests = commit
            .files
            .iter()
            .map(|file| self.request(&file.path, &file.diff))
            .collect();
        let report = self.run_batch(commit.short_hash(), requests, cancel).await;

        let usable: Vec<&ScoreResult> = report
            .items
            .iter()
            .map(|item| &item.result)
            .filter(|r| !r.is_degraded())
            .collect();
        let basis: Vec<&ScoreResult> = if usable.is_empty() {
            report.items.iter().map(|item| &item.result).collect()
        } else {
            usable
        };

        let (dimension_means, overall) = if basis.is_empty() {
            ([f64::from(NEUTRAL_SCORE); 7], f64::from(NEUTRAL_SCORE))
        } else {
            let count = basis.len() as f64;
            let mut means = [0.0; 7];
            for dim in Dimension::ALL {
                let sum: f64 = basis.iter().map(|r| f64::from(r.get(dim))).sum();
                means[dim.index()] = round_one_decimal(sum / count);
            }
            let overall = round_one_decimal(basis.iter().map(|r| r.overall).sum::<f64>() / count);
            (means, overall)
        };

        info!(
            "[{}] ⭐ 提交总分 {:.1} (降级 {}/{})",
            commit.short_hash(),
            overall,
            report.summary.degraded,
            report.summary.scored
        );

        CommitReport {
            meta: commit.meta.clone(),
            files: report.items,
            dimension_means,
            overall,
            summary: report.summary,
        }
    }

    async fn run_batch(
        &self,
        scope: &str,
        requests: Vec<ScoreRequest>,
        cancel: &CancelHandle,
    ) -> BatchReport {
        let started = Instant::now();
        let total = requests.len();

        // 批内去重：每组相同内容只保留第一个请求参与调度
        let mut leaders: Vec<usize> = Vec::new();
        let mut slot_of: Vec<usize> = Vec::with_capacity(total);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (idx, request) in requests.iter().enumerate() {
            if self.flow.cache_enabled() {
                let key = ResultMemo::key_for(&request.content);
                if let Some(&slot) = seen.get(&key) {
                    slot_of.push(slot);
                    continue;
                }
                seen.insert(key, leaders.len());
            }
            slot_of.push(leaders.len());
            leaders.push(idx);
        }

        let segmenter = self.flow.segmenter();
        let costs: Vec<usize> = leaders
            .iter()
            .map(|&idx| requests[idx].estimated_cost)
            .collect();
        let oversized = leaders
            .iter()
            .filter(|&&idx| segmenter.is_oversized(&requests[idx]))
            .count();
        let unique = leaders.len();
        if unique < total {
            info!("♻️ 批内去重: {} 个请求内容重复", total - unique);
        }

        let slots = self
            .scheduler
            .run(&costs, oversized, cancel, |slot| {
                let flow = self.flow.clone();
                let request = requests[leaders[slot]].clone();
                let ctx = RequestCtx::new(scope, request.id.clone(), slot + 1, unique);
                async move { flow.run(&request, &ctx).await }
            })
            .await;

        // 按输入顺序组装结果
        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        let mut claimed = vec![false; unique];
        let mut items = Vec::with_capacity(total);

        for (idx, request) in requests.iter().enumerate() {
            let slot = slot_of[idx];
            let (result, from_cache) = match &slots[slot] {
                Slot::Done(outcome) => {
                    let duplicate = claimed[slot];
                    claimed[slot] = true;
                    if duplicate {
                        self.memo.record_hit();
                    }
                    (outcome.result.clone(), outcome.from_cache || duplicate)
                }
                Slot::Failed(reason) => (
                    ScoreResult::degraded(format!("评分任务异常结束: {}", reason)),
                    false,
                ),
                Slot::Cancelled => {
                    summary.cancelled += 1;
                    continue;
                }
            };

            match result.provenance {
                Provenance::Direct => summary.direct += 1,
                Provenance::ChunkMerged => summary.merged += 1,
                Provenance::Degraded => summary.degraded += 1,
            }
            if from_cache {
                summary.cache_hits += 1;
            }
            items.push(ScoredItem {
                id: request.id.clone(),
                result,
                from_cache,
            });
        }

        for slot in &slots {
            if let Slot::Done(outcome) = slot {
                summary.calls += outcome.calls;
                summary.rate_limit_incidents += outcome.rate_limited;
            }
        }
        summary.scored = items.len();
        summary.cache_hit_rate = if summary.scored == 0 {
            0.0
        } else {
            summary.cache_hits as f64 / summary.scored as f64
        };
        summary.elapsed = started.elapsed();

        info!(
            "[{}] ✓ 批次完成: {}/{} 个结果，降级 {}，缓存命中 {}，调用 {} 次，耗时 {:.1}s",
            scope,
            summary.scored,
            summary.total,
            summary.degraded,
            summary.cache_hits,
            summary.calls,
            summary.elapsed.as_secs_f64()
        );

        BatchReport { items, summary }
    }
}

//! 单个请求的评分流程 - 流程层
//!
//! 核心职责：定义"一个文件 diff"的完整评分流程
//!
//! 流程顺序：
//! 1. 查缓存 → 命中直接返回
//! 2. 超长 → 拆分，逐块评分后合并
//! 3. 申请额度 → 并发闸门 → 调用评分服务 → 规范化
//! 4. 失败按错误类别处理：限流/临时错误退避重试，上下文超长递归拆分，其余降级

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ScoringError;
use crate::infrastructure::{RateController, ResultMemo};
use crate::models::{ChunkPlan, ScoreRequest, ScoreResult};
use crate::services::llm_service::ScoringCapability;
use crate::services::merge::merge_chunk_results;
use crate::services::normalizer::ResponseNormalizer;
use crate::services::prompt;
use crate::services::segmenter::InputSegmenter;
use crate::workflow::request_ctx::RequestCtx;

/// 请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    CacheHit,
    Segmenting,
    Dispatching,
    Normalizing,
    RateLimited,
    ProviderError,
    Retry,
    ContextTooLarge,
    Degraded,
    Done,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Pending => "PENDING",
            RequestState::CacheHit => "CACHE_HIT",
            RequestState::Segmenting => "SEGMENTING",
            RequestState::Dispatching => "DISPATCHING",
            RequestState::Normalizing => "NORMALIZE",
            RequestState::RateLimited => "RATE_LIMITED",
            RequestState::ProviderError => "PROVIDER_ERROR",
            RequestState::Retry => "RETRY",
            RequestState::ContextTooLarge => "CONTEXT_TOO_LARGE",
            RequestState::Degraded => "DEGRADED",
            RequestState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// 重试策略：`min(base × 2^attempt, max)`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: secs(config.backoff_base_seconds),
            max_backoff: secs(config.max_backoff_seconds),
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        self.backoff_base.mul_f64(factor).min(self.max_backoff)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// 单个请求的评分结果
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub result: ScoreResult,
    pub from_cache: bool,
    /// 实际发出的调用次数（含重试）
    pub calls: u32,
    /// 遇到限流的次数
    pub rate_limited: u32,
}

#[derive(Debug, Default)]
struct DispatchStats {
    calls: u32,
    rate_limited: u32,
}

/// 评分流程
///
/// - 编排单个请求的完整评分流程
/// - 决定何时拆分、何时重试、何时降级
/// - 共享资源（控制器、缓存、并发闸门）只通过句柄持有
#[derive(Clone)]
pub struct EvaluationFlow {
    scorer: Arc<dyn ScoringCapability>,
    controller: RateController,
    memo: ResultMemo,
    segmenter: InputSegmenter,
    normalizer: Arc<ResponseNormalizer>,
    gate: Arc<Semaphore>,
    retry: RetryPolicy,
    cache_enabled: bool,
    system_prompt: Arc<str>,
}

impl EvaluationFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scorer: Arc<dyn ScoringCapability>,
        controller: RateController,
        memo: ResultMemo,
        segmenter: InputSegmenter,
        normalizer: Arc<ResponseNormalizer>,
        max_concurrency: usize,
        retry: RetryPolicy,
        cache_enabled: bool,
    ) -> Self {
        Self {
            scorer,
            controller,
            memo,
            segmenter,
            normalizer,
            gate: Arc::new(Semaphore::new(max_concurrency.max(1))),
            retry,
            cache_enabled,
            system_prompt: Arc::from(prompt::system_prompt()),
        }
    }

    pub fn segmenter(&self) -> &InputSegmenter {
        &self.segmenter
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub async fn run(&self, request: &ScoreRequest, ctx: &RequestCtx) -> FlowOutcome {
        self.enter(ctx, RequestState::Pending);

        // ========== 流程 1: 查缓存 ==========
        let key = ResultMemo::key_for(&request.content);
        if self.cache_enabled {
            if let Some(result) = self.memo.get(&key) {
                self.enter(ctx, RequestState::CacheHit);
                info!("{} ✓ 命中缓存 (overall {:.1})", ctx, result.overall);
                return FlowOutcome {
                    result,
                    from_cache: true,
                    calls: 0,
                    rate_limited: 0,
                };
            }
        }

        // ========== 流程 2: 拆分或直接评分 ==========
        let mut stats = DispatchStats::default();
        let result = if self.segmenter.is_oversized(request) {
            self.enter(ctx, RequestState::Segmenting);
            let plan = self.segmenter.plan(request);
            info!(
                "{} ✂️ 内容过长 (约 {} 单位)，拆分为 {} 块",
                ctx,
                request.estimated_cost,
                plan.len()
            );
            self.score_plan(plan, ctx, &mut stats).await
        } else {
            self.score_piece(request.clone(), self.segmenter.ceiling(), ctx, &mut stats)
                .await
        };

        // ========== 流程 3: 写缓存 ==========
        if result.is_degraded() {
            self.enter(ctx, RequestState::Degraded);
            warn!("{} ⚠️ 评分降级: {}", ctx, result.commentary);
        } else if self.cache_enabled {
            self.memo.put(key, result.clone());
        }
        self.enter(ctx, RequestState::Done);
        info!(
            "{} ✓ 评分完成: overall {:.1} ({:?}, 调用 {} 次)",
            ctx, result.overall, result.provenance, stats.calls
        );

        FlowOutcome {
            result,
            from_cache: false,
            calls: stats.calls,
            rate_limited: stats.rate_limited,
        }
    }

    /// 逐块评分并按块顺序合并
    fn score_plan<'a>(
        &'a self,
        plan: ChunkPlan,
        ctx: &'a RequestCtx,
        stats: &'a mut DispatchStats,
    ) -> BoxFuture<'a, ScoreResult> {
        async move {
            let cap = plan.cap;
            let mut results = Vec::with_capacity(plan.len());
            for chunk in plan.chunks {
                debug!("{} 评分分块 {}", ctx, chunk.id);
                results.push(self.score_piece(chunk, cap, ctx, &mut *stats).await);
            }
            merge_chunk_results(&results)
        }
        .boxed()
    }

    /// 评分一个不需要预先拆分的片段
    ///
    /// `cap` 是生成该片段时使用的单块上限，上下文超长时以它为基准减半重拆。
    fn score_piece<'a>(
        &'a self,
        piece: ScoreRequest,
        cap: usize,
        ctx: &'a RequestCtx,
        stats: &'a mut DispatchStats,
    ) -> BoxFuture<'a, ScoreResult> {
        async move {
            match self.dispatch(&piece, ctx, &mut *stats).await {
                Ok(raw) => {
                    self.enter(ctx, RequestState::Normalizing);
                    self.normalizer.normalize(&raw)
                }
                Err(ScoringError::ContextTooLarge { message }) => {
                    self.enter(ctx, RequestState::ContextTooLarge);
                    match self.segmenter.replan(&piece, cap) {
                        Some(plan) => {
                            warn!(
                                "{} ⚠️ 上下文超长，单块上限降为 {}，重新拆分为 {} 块",
                                ctx,
                                plan.cap,
                                plan.len()
                            );
                            self.score_plan(plan, ctx, &mut *stats).await
                        }
                        None => ScoreResult::degraded(format!(
                            "输入超过上下文长度且已达到最小分块 ({}): {}",
                            self.segmenter.floor(),
                            message
                        )),
                    }
                }
                Err(e) => ScoreResult::degraded(e.to_string()),
            }
        }
        .boxed()
    }

    /// 发送一次评分调用，限流和临时错误按重试策略退避
    async fn dispatch(
        &self,
        piece: &ScoreRequest,
        ctx: &RequestCtx,
        stats: &mut DispatchStats,
    ) -> Result<String, ScoringError> {
        let user_prompt = match prompt::chunk_position(&piece.id) {
            Some((parent, index, total)) => {
                prompt::user_prompt(parent, &piece.content, Some((index, total)))
            }
            None => prompt::user_prompt(&piece.id, &piece.content, None),
        };
        let units = piece.estimated_cost.max(1) as f64;
        let mut attempt = 0u32;

        loop {
            let waited = self.controller.acquire(units).await;
            if !waited.is_zero() {
                debug!("{} 等待额度 {:?}", ctx, waited);
            }

            self.enter(ctx, RequestState::Dispatching);
            let reply = {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| ScoringError::fatal("并发闸门已关闭"))?;
                stats.calls += 1;
                self.scorer.send(&self.system_prompt, &user_prompt).await
            };

            let error = match reply {
                Ok(raw) => {
                    self.controller.record_outcome(false);
                    return Ok(raw);
                }
                Err(e) => e,
            };

            let retry_after = match error {
                ScoringError::RateLimited { retry_after } => {
                    self.enter(ctx, RequestState::RateLimited);
                    self.controller.record_outcome(true);
                    stats.rate_limited += 1;
                    retry_after
                }
                ScoringError::Transient { .. } => {
                    self.enter(ctx, RequestState::ProviderError);
                    self.controller.record_outcome(false);
                    None
                }
                ScoringError::ContextTooLarge { .. } | ScoringError::Fatal { .. } => {
                    self.controller.record_outcome(false);
                    return Err(error);
                }
            };

            if attempt >= self.retry.max_retries {
                warn!(
                    "{} ❌ 已重试 {} 次仍失败: {}",
                    ctx, self.retry.max_retries, error
                );
                return Err(error);
            }

            let delay = self
                .retry
                .backoff(attempt)
                .max(retry_after.unwrap_or_default());
            attempt += 1;
            self.enter(ctx, RequestState::Retry);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "{} ⚠️ {}，稍后重试",
                ctx,
                error
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn enter(&self, ctx: &RequestCtx, state: RequestState) {
        debug!("{} → {}", ctx, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::infrastructure::RateControllerConfig;

    const GOOD: &str = r#"{"readability":8,"efficiency":7,"security":9,"structure":7,"error_handling":6,"documentation":8,"code_style":8,"overall_score":7.6,"comments":"ok"}"#;

    /// 按脚本依次返回结果，脚本用完后一律返回 GOOD
    struct Scripted {
        replies: Mutex<VecDeque<Result<String, ScoringError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, ScoringError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ScoringCapability for Scripted {
        async fn send(&self, _system: &str, _user: &str) -> Result<String, ScoringError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(GOOD.to_string()))
        }
    }

    fn flow(scorer: Arc<Scripted>, ceiling: usize, floor: usize) -> EvaluationFlow {
        let controller = RateController::new(RateControllerConfig {
            rate_per_minute: 600_000.0,
            max_concurrency: 4,
            min_request_interval: Duration::ZERO,
        });
        EvaluationFlow::new(
            scorer,
            controller,
            ResultMemo::new(),
            InputSegmenter::new(ceiling, floor),
            Arc::new(ResponseNormalizer::new().unwrap()),
            4,
            RetryPolicy {
                max_retries: 3,
                backoff_base: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
            },
            true,
        )
    }

    fn ctx() -> RequestCtx {
        RequestCtx::new("test", "src/lib.rs", 1, 1)
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_content_calls_once() {
        let scorer = Scripted::new(vec![]);
        let flow = flow(scorer.clone(), 8_000, 250);
        let request = flow.segmenter().request("a.rs", "+let x = 1;\n");

        let first = flow.run(&request, &ctx()).await;
        let second = flow.run(&request, &ctx()).await;

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.result, second.result);
        assert_eq!(scorer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_then_success() {
        let scorer = Scripted::new(vec![
            Err(ScoringError::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
            }),
            Ok(GOOD.to_string()),
        ]);
        let flow = flow(scorer.clone(), 8_000, 250);
        let request = flow.segmenter().request("a.rs", "+let x = 1;\n");

        let started = tokio::time::Instant::now();
        let outcome = flow.run(&request, &ctx()).await;

        assert_eq!(outcome.result.overall, 7.6);
        assert_eq!(outcome.rate_limited, 1);
        assert_eq!(outcome.calls, 2);
        // retry-after 提示大于退避基数
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_retries_and_degrades() {
        let scorer = Scripted::new(
            (0..10)
                .map(|_| Err(ScoringError::transient("connection reset")))
                .collect(),
        );
        let flow = flow(scorer.clone(), 8_000, 250);
        let request = flow.segmenter().request("a.rs", "+let x = 1;\n");

        let outcome = flow.run(&request, &ctx()).await;

        assert!(outcome.result.is_degraded());
        assert_eq!(scorer.calls(), 4);
        assert!(outcome.result.commentary.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried_and_not_cached() {
        let scorer = Scripted::new(vec![Err(ScoringError::fatal("invalid api key"))]);
        let flow = flow(scorer.clone(), 8_000, 250);
        let request = flow.segmenter().request("a.rs", "+let x = 1;\n");

        let outcome = flow.run(&request, &ctx()).await;
        assert!(outcome.result.is_degraded());
        assert_eq!(scorer.calls(), 1);

        // 降级结果不进入缓存，下一次重新调用
        let again = flow.run(&request, &ctx()).await;
        assert!(!again.from_cache);
        assert!(!again.result.is_degraded());
        assert_eq!(scorer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_too_large_resplits() {
        let scorer = Scripted::new(vec![Err(ScoringError::context_too_large(
            "maximum context length exceeded",
        ))]);
        let flow = flow(scorer.clone(), 2_000, 100);
        let content = "+    let value = compute(input, &mut cache);\n".repeat(100);
        let request = flow.segmenter().request("big.rs", content);
        assert!(!flow.segmenter().is_oversized(&request));

        let outcome = flow.run(&request, &ctx()).await;

        assert!(!outcome.result.is_degraded());
        assert_eq!(outcome.result.provenance, crate::models::Provenance::ChunkMerged);
        assert!(scorer.calls() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_too_large_below_floor_degrades() {
        let scorer = Scripted::new(
            (0..50)
                .map(|_| Err(ScoringError::context_too_large("too many tokens")))
                .collect(),
        );
        let flow = flow(scorer.clone(), 400, 100);
        let content = "+    let value = compute(input, &mut cache);\n".repeat(20);
        let request = flow.segmenter().request("big.rs", content);

        let outcome = flow.run(&request, &ctx()).await;

        assert!(outcome.result.is_degraded());
    }
}

//! 批次调度器 - 编排层
//!
//! ## 职责
//!
//! 把一批请求按"波次"派发出去，每一波完成后再开始下一波。
//!
//! ## 核心功能
//!
//! 1. **排序**：估算额度最小的请求先派发
//! 2. **定额**：按批次规模和超长请求比例确定基础并发，每波再受控制器当前并发上限约束
//! 3. **波间延迟**：按"下一波所需额度与当前可用额度的差距"计算，截断到 [下限, 上限]，
//!    再叠加与近期限流次数成正比的惩罚
//! 4. **取消**：取消后不再派发新的波次，已在途的调用自然结束

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::Config;
use crate::infrastructure::RateController;
use crate::utils::logging::{log_wave_complete, log_wave_start};

/// 每次近期限流追加的波间惩罚
pub const INCIDENT_PENALTY: Duration = Duration::from_secs(2);

/// 取消句柄
///
/// 克隆后共享同一个取消状态
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 等待取消信号
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 单个任务的结局
#[derive(Debug)]
pub enum Slot<T> {
    Done(T),
    /// 任务 panic 或被运行时中止
    Failed(String),
    /// 取消后未派发
    Cancelled,
}

/// 调度参数
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub wave_delay_floor: Duration,
    pub wave_delay_ceiling: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            wave_delay_floor: Duration::from_millis(config.wave_delay_floor_ms),
            wave_delay_ceiling: Duration::from_millis(config.wave_delay_ceiling_ms),
        }
    }
}

/// 批次调度器
#[derive(Clone)]
pub struct BatchScheduler {
    controller: RateController,
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(controller: RateController, config: SchedulerConfig) -> Self {
        Self { controller, config }
    }

    /// 基础并发
    ///
    /// # 参数
    /// - `total`: 请求总数
    /// - `oversized`: 需要拆分的请求数
    ///
    /// # 返回
    /// ≤10 个用满并发；≤50 个减一；≤200 个减半；更多只用 1。
    /// 超长请求占比 ≥25%（且至少 2 个）时再降一档，最低 1。
    pub fn base_concurrency(&self, total: usize, oversized: usize) -> usize {
        let max = self.config.max_concurrency.max(1);
        let mut base = match total {
            0..=10 => max,
            11..=50 => max.saturating_sub(1),
            51..=200 => max / 2,
            _ => 1,
        }
        .max(1);

        if oversized >= 2 && oversized * 4 >= total {
            base = step_down(base, max);
        }
        base.max(1)
    }

    /// 本波大小：基础并发与控制器当前上限取小
    pub fn wave_size(&self, base: usize) -> usize {
        base.min(self.controller.concurrency_ceiling()).max(1)
    }

    /// 两波之间的等待时间
    ///
    /// # 参数
    /// - `next_need`: 下一波的估算额度之和
    pub fn inter_wave_delay(&self, next_need: f64) -> Duration {
        let snapshot = self.controller.snapshot();
        let per_second = snapshot.rate_per_minute / 60.0;
        let gap = (next_need - snapshot.available_units).max(0.0);
        let wait = if per_second > 0.0 {
            Duration::try_from_secs_f64(gap / per_second).unwrap_or(self.config.wave_delay_ceiling)
        } else {
            self.config.wave_delay_ceiling
        };

        let floor = self.config.wave_delay_floor;
        let ceiling = self.config.wave_delay_ceiling.max(floor);
        let penalty = INCIDENT_PENALTY
            .saturating_mul(snapshot.recent_incidents as u32)
            .min(ceiling);

        wait.clamp(floor, ceiling) + penalty
    }

    /// 按额度从小到大排列的下标（额度相同保持原顺序）
    pub fn order(costs: &[usize]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..costs.len()).collect();
        order.sort_by_key(|&i| costs[i]);
        order
    }

    /// 分波派发
    ///
    /// # 参数
    /// - `costs`: 每个任务的估算额度
    /// - `oversized`: 需要拆分的任务数
    /// - `cancel`: 取消句柄
    /// - `worker`: 按下标创建任务
    ///
    /// # 返回
    /// 与 `costs` 等长、按原下标排列的结局
    pub async fn run<T, F, Fut>(
        &self,
        costs: &[usize],
        oversized: usize,
        cancel: &CancelHandle,
        worker: F,
    ) -> Vec<Slot<T>>
    where
        T: Send + 'static,
        F: Fn(usize) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = costs.len();
        let mut slots: Vec<Slot<T>> = (0..total).map(|_| Slot::Cancelled).collect();
        if total == 0 {
            return slots;
        }

        let order = Self::order(costs);
        let base = self.base_concurrency(total, oversized);
        info!(
            "📋 共 {} 个请求，其中 {} 个需要拆分，基础并发 {}",
            total, oversized, base
        );

        let mut cursor = 0;
        let mut wave_num = 0;
        while cursor < total {
            if cancel.is_cancelled() {
                info!("⏹️ 已取消，剩余 {} 个请求不再派发", total - cursor);
                break;
            }

            let size = self.wave_size(base);
            let wave = &order[cursor..(cursor + size).min(total)];
            wave_num += 1;
            log_wave_start(wave_num, wave.len(), cursor, total);

            // 为本波创建并发任务
            let handles: Vec<_> = wave
                .iter()
                .map(|&idx| (idx, tokio::spawn(worker(idx))))
                .collect();

            // 等待本波所有任务完成
            let mut finished = 0;
            for (idx, handle) in handles {
                match handle.await {
                    Ok(output) => {
                        finished += 1;
                        slots[idx] = Slot::Done(output);
                    }
                    Err(e) => {
                        error!("[请求 {}] 任务执行失败: {}", idx + 1, e);
                        slots[idx] = Slot::Failed(e.to_string());
                    }
                }
            }
            cursor += wave.len();
            log_wave_complete(wave_num, finished, wave.len());

            if cursor >= total {
                break;
            }

            let next_size = self.wave_size(base);
            let next_need: f64 = order[cursor..(cursor + next_size).min(total)]
                .iter()
                .map(|&i| costs[i] as f64)
                .sum();
            let delay = self.inter_wave_delay(next_need);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }

        slots
    }
}

/// 在 [满并发, 减一, 减半, 1] 的档位上降一档
fn step_down(current: usize, max: usize) -> usize {
    let tiers = [max, max.saturating_sub(1), max / 2, 1];
    tiers
        .into_iter()
        .map(|t| t.max(1))
        .find(|&t| t < current)
        .unwrap_or(1)
}

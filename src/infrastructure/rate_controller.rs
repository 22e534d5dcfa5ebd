//! 速率控制器 - 基础设施层
//!
//! 基于令牌桶的准入控制，并根据调用结果自适应地调整速率与并发上限。
//!
//! ## 设计要点
//!
//! - 令牌按 `rate_per_minute / 60` 每秒补充，上限为配置的速率
//! - 额度不足时先拿走现有令牌，剩余部分进入等待队列
//! - 等待队列按所需等待时间升序排列（所需最少者优先）
//! - 补充定时任务只在有等待者时运行，队列清空即退出
//! - 所有状态由一把互斥锁保护，锁从不跨越 await
//!
//! 控制器以句柄形式传递（`Clone` 共享同一份状态），同一进程内可以存在多个相互独立的控制器。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 限流后速率除以该系数，最小请求间隔乘以该系数
pub const BACKOFF_FACTOR: f64 = 1.5;
/// 恢复时速率乘以该系数
pub const RECOVERY_FACTOR: f64 = 1.2;
/// 触发恢复所需的连续成功次数
pub const RECOVERY_SUCCESS_THRESHOLD: u32 = 10;
/// 两次调整之间的最短间隔
pub const ADJUSTMENT_COOLDOWN: Duration = Duration::from_secs(60);
/// 统计“近期限流次数”的时间窗口
pub const INCIDENT_WINDOW: Duration = Duration::from_secs(300);

/// 被限流后最小请求间隔的起点
const MIN_INTERVAL_SEED: Duration = Duration::from_millis(100);
/// 最小请求间隔的上限，反复限流后不再继续放大
pub const MAX_MIN_INTERVAL: Duration = Duration::from_secs(10);
/// 速率下限，防止反复退避后趋近于零
const MIN_RATE_PER_MINUTE: f64 = 1.0;
/// 浮点误差容忍度
const EPSILON: f64 = 1e-6;

/// 控制器配置
#[derive(Debug, Clone)]
pub struct RateControllerConfig {
    pub rate_per_minute: f64,
    pub max_concurrency: usize,
    pub min_request_interval: Duration,
}

/// 控制器状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    pub rate_per_minute: f64,
    pub available_units: f64,
    pub concurrency_ceiling: usize,
    pub min_request_interval: Duration,
    pub pending_waiters: usize,
    pub recent_incidents: usize,
}

/// 速率控制器句柄
#[derive(Clone)]
pub struct RateController {
    inner: Arc<Inner>,
}

struct Inner {
    initial: RateControllerConfig,
    state: Mutex<RateBudget>,
    /// 新等待者入队时唤醒补充任务，重新计算唤醒时间
    wake: Notify,
}

/// 令牌桶及自适应计数器
struct RateBudget {
    rate_per_minute: f64,
    available_units: f64,
    last_refill: Instant,
    /// 按剩余需求升序排列
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
    tick_running: bool,

    min_interval: Duration,
    next_slot: Option<Instant>,

    concurrency_ceiling: usize,
    consecutive_successes: u32,
    last_adjustment: Instant,
    incidents: VecDeque<Instant>,
}

struct Waiter {
    id: u64,
    remaining: f64,
    notify: oneshot::Sender<()>,
}

impl RateController {
    pub fn new(config: RateControllerConfig) -> Self {
        let now = Instant::now();
        let rate = config.rate_per_minute.max(MIN_RATE_PER_MINUTE);
        let state = RateBudget {
            rate_per_minute: rate,
            available_units: rate,
            last_refill: now,
            waiters: Vec::new(),
            next_waiter_id: 0,
            tick_running: false,
            min_interval: config.min_request_interval,
            next_slot: None,
            concurrency_ceiling: config.max_concurrency.max(1),
            consecutive_successes: 0,
            last_adjustment: now,
            incidents: VecDeque::new(),
        };
        Self {
            inner: Arc::new(Inner {
                initial: RateControllerConfig {
                    rate_per_minute: rate,
                    ..config
                },
                state: Mutex::new(state),
                wake: Notify::new(),
            }),
        }
    }

    /// 由全局配置创建
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(RateControllerConfig {
            rate_per_minute: f64::from(config.rate_per_minute),
            max_concurrency: config.max_concurrency,
            min_request_interval: Duration::from_millis(config.min_request_interval_ms),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RateBudget> {
        lock_budget(&self.inner.state)
    }

    /// 申请 `units` 额度，返回实际等待的时长
    ///
    /// 额度充足时立即返回零；否则先消耗现有令牌，剩余部分排队等待补充。
    pub async fn acquire(&self, units: f64) -> Duration {
        let units = if units.is_finite() { units.max(0.0) } else { 0.0 };
        let started = Instant::now();

        let (receiver, spacing) = {
            let mut state = self.lock();
            let now = Instant::now();
            state.refill(self.capacity(), now);
            // 已排队的等待者优先，剩余令牌才轮到新请求
            state.serve_waiters();
            let spacing = state.reserve_slot(now);

            if state.waiters.is_empty() && state.available_units + EPSILON >= units {
                state.available_units = (state.available_units - units).max(0.0);
                (None, spacing)
            } else {
                let taken = state.available_units;
                state.available_units = 0.0;
                let remaining = units - taken;

                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.enqueue(Waiter {
                    id,
                    remaining,
                    notify: tx,
                });
                debug!(
                    waiter = id,
                    remaining,
                    queued = state.waiters.len(),
                    "额度不足，进入等待队列"
                );

                if state.tick_running {
                    self.inner.wake.notify_one();
                } else {
                    state.tick_running = true;
                    let handle = self.clone();
                    tokio::spawn(async move { handle.replenish_loop().await });
                }
                (Some(rx), spacing)
            }
        };

        if let Some(rx) = receiver {
            // 发送端只会在满足后才被消费，这里的错误只可能来自运行时关闭
            let _ = rx.await;
        }
        if let Some(spacing) = spacing {
            tokio::time::sleep_until(spacing).await;
        }

        started.elapsed()
    }

    /// 补充定时任务：按队首需求计算下一次唤醒时间，队列清空即退出
    async fn replenish_loop(self) {
        loop {
            let sleep_for = {
                let mut state = self.lock();
                state.refill(self.capacity(), Instant::now());
                state.serve_waiters();

                match state.waiters.first() {
                    None => {
                        state.tick_running = false;
                        debug!("等待队列已清空，补充任务退出");
                        return;
                    }
                    Some(head) => {
                        let per_second = state.rate_per_minute / 60.0;
                        let deficit = (head.remaining - state.available_units).max(0.0);
                        Duration::from_secs_f64(deficit / per_second)
                            .max(Duration::from_millis(1))
                    }
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.inner.wake.notified() => {}
            }
        }
    }

    /// 反馈一次调用结果
    ///
    /// - 被限流：速率 ÷ 1.5，最小间隔 × 1.5（不超过 10 秒），并发上限 − 1（最低 1）
    /// - 连续成功 ≥ 10 次且距上次调整 ≥ 60 秒：速率 × 1.2（不超过初始值），并发上限 + 1
    pub fn record_outcome(&self, rate_limited: bool) {
        let initial = &self.inner.initial;
        let mut state = self.lock();
        let now = Instant::now();

        if rate_limited {
            let before = state.rate_per_minute;
            state.rate_per_minute = (before / BACKOFF_FACTOR).max(MIN_RATE_PER_MINUTE);
            state.min_interval = backoff_interval(state.min_interval);
            state.concurrency_ceiling = state.concurrency_ceiling.saturating_sub(1).max(1);
            state.consecutive_successes = 0;
            state.last_adjustment = now;
            state.incidents.push_back(now);
            state.prune_incidents(now);
            warn!(
                rate_before = before,
                rate_after = state.rate_per_minute,
                concurrency = state.concurrency_ceiling,
                "⚠️ 触发限流，降低速率"
            );
            return;
        }

        state.consecutive_successes += 1;
        let degraded = state.rate_per_minute + EPSILON < initial.rate_per_minute
            || state.concurrency_ceiling < initial.max_concurrency;
        if degraded
            && state.consecutive_successes >= RECOVERY_SUCCESS_THRESHOLD
            && now.duration_since(state.last_adjustment) >= ADJUSTMENT_COOLDOWN
        {
            let before = state.rate_per_minute;
            state.rate_per_minute = (before * RECOVERY_FACTOR).min(initial.rate_per_minute);
            state.concurrency_ceiling = (state.concurrency_ceiling + 1).min(initial.max_concurrency.max(1));
            state.min_interval = if state.rate_per_minute + EPSILON >= initial.rate_per_minute {
                initial.min_request_interval
            } else {
                state.min_interval.div_f64(RECOVERY_FACTOR)
            };
            state.consecutive_successes = 0;
            state.last_adjustment = now;
            info!(
                rate_before = before,
                rate_after = state.rate_per_minute,
                concurrency = state.concurrency_ceiling,
                "✓ 连续成功，恢复速率"
            );
        }
    }

    /// 当前并发上限
    pub fn concurrency_ceiling(&self) -> usize {
        self.lock().concurrency_ceiling
    }

    /// 当前每分钟速率
    pub fn rate_per_minute(&self) -> f64 {
        self.lock().rate_per_minute
    }

    /// 当前可用额度（先按时间补充）
    pub fn available_units(&self) -> f64 {
        let mut state = self.lock();
        state.refill(self.capacity(), Instant::now());
        state.available_units
    }

    /// 近期（5 分钟内）的限流次数
    pub fn recent_incidents(&self) -> usize {
        let mut state = self.lock();
        state.prune_incidents(Instant::now());
        state.incidents.len()
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let mut state = self.lock();
        let now = Instant::now();
        state.refill(self.capacity(), now);
        state.prune_incidents(now);
        RateSnapshot {
            rate_per_minute: state.rate_per_minute,
            available_units: state.available_units,
            concurrency_ceiling: state.concurrency_ceiling,
            min_request_interval: state.min_interval,
            pending_waiters: state.waiters.len(),
            recent_incidents: state.incidents.len(),
        }
    }

    fn capacity(&self) -> f64 {
        self.inner.initial.rate_per_minute
    }
}

impl RateBudget {
    fn refill(&mut self, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let added = elapsed * self.rate_per_minute / 60.0;
            self.available_units = (self.available_units + added).min(capacity);
            self.last_refill = now;
        }
    }

    /// 按剩余需求升序插入，需求相同时先到先得
    fn enqueue(&mut self, waiter: Waiter) {
        let pos = self
            .waiters
            .partition_point(|w| w.remaining.total_cmp(&waiter.remaining).is_le());
        self.waiters.insert(pos, waiter);
    }

    /// 把现有令牌依次分配给队首等待者
    fn serve_waiters(&mut self) {
        while let Some(head) = self.waiters.first_mut() {
            if self.available_units <= 0.0 {
                break;
            }
            let grant = head.remaining.min(self.available_units);
            head.remaining -= grant;
            self.available_units = (self.available_units - grant).max(0.0);

            if head.remaining > EPSILON {
                break;
            }
            let done = self.waiters.remove(0);
            debug!(waiter = done.id, "等待者额度已满足");
            // 等待者可能已被取消（future 被丢弃），忽略发送失败
            let _ = done.notify.send(());
        }
    }

    /// 按最小请求间隔预留发送时间点，返回需要等到的时刻
    fn reserve_slot(&mut self, now: Instant) -> Option<Instant> {
        if self.min_interval.is_zero() {
            return None;
        }
        let slot = match self.next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next_slot = slot.checked_add(self.min_interval).or(Some(slot));
        (slot > now).then_some(slot)
    }

    fn prune_incidents(&mut self, now: Instant) {
        while let Some(&oldest) = self.incidents.front() {
            if now.saturating_duration_since(oldest) > INCIDENT_WINDOW {
                self.incidents.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 限流后的最小请求间隔：× 1.5，截断到 [`MAX_MIN_INTERVAL`]
fn backoff_interval(current: Duration) -> Duration {
    let seconds = current.max(MIN_INTERVAL_SEED).as_secs_f64() * BACKOFF_FACTOR;
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MAX_MIN_INTERVAL)
        .min(MAX_MIN_INTERVAL)
}

fn lock_budget(state: &Mutex<RateBudget>) -> MutexGuard<'_, RateBudget> {
    // 持锁期间不会 panic，中毒时直接沿用内部状态
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

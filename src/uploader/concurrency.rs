// 自适应并发控制器
//
// 全局共享（每个 Uploader 实例一个），限制所有会话同时在传输中的分片数
//
// 调整策略（每个分片完成后根据速度样本调用）：
// - 单连接速度 < 2 MB/s 且 limit > 2：limit - 1
// - 单连接速度 > 5 MB/s 且总速度 > 15 MB/s 且 limit < 2 × 默认值：limit + 1
// - 恢复探测：每 15 秒窗口最多一次，定时器到期后无条件 limit + 1（不超过上限）

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// 降低并发的单连接速度阈值 (MB/s)
const DECREASE_THRESHOLD_MBS: f64 = 2.0;

/// 理想的单连接速度 (MB/s)
const IDEAL_PER_CONNECTION_MBS: f64 = 5.0;

/// 提高并发所需的总速度阈值 (MB/s)
const INCREASE_THRESHOLD_MBS: f64 = 15.0;

/// 并发下限（自适应降低不会低于该值）
const MIN_ADAPTIVE_LIMIT: usize = 2;

/// 恢复探测窗口
const RECOVERY_PROBE_WINDOW: Duration = Duration::from_secs(15);

/// 网络连接类型（由外部探测提供）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveConnectionType {
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
}

impl EffectiveConnectionType {
    /// 从 "slow-2g" / "2g" / "3g" / "4g" 解析
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "slow-2g" | "slow_2g" => Some(Self::Slow2g),
            "2g" => Some(Self::TwoG),
            "3g" => Some(Self::ThreeG),
            "4g" => Some(Self::FourG),
            _ => None,
        }
    }
}

/// 网络质量提示
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkQuality {
    pub effective_type: EffectiveConnectionType,
    /// 下行带宽估计 (Mbps)
    pub downlink_mbps: f64,
}

/// 网络质量探测（可选的外部协作者）
pub trait NetworkProbe: Send + Sync {
    /// 返回 None 表示无法探测，使用默认并发数
    fn sample(&self) -> Option<NetworkQuality>;
}

/// 根据网络质量计算初始并发数
pub fn initial_limit(default_limit: usize, hint: Option<NetworkQuality>) -> usize {
    let default_limit = default_limit.max(1);
    let Some(quality) = hint else {
        return default_limit;
    };

    match quality.effective_type {
        EffectiveConnectionType::Slow2g | EffectiveConnectionType::TwoG => 1,
        EffectiveConnectionType::ThreeG => (default_limit / 2).max(1),
        EffectiveConnectionType::FourG if quality.downlink_mbps < 1.5 => (default_limit / 2).max(1),
        EffectiveConnectionType::FourG if quality.downlink_mbps >= 10.0 => default_limit * 2,
        EffectiveConnectionType::FourG => default_limit,
    }
}

/// 并发状态快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrencyState {
    pub current_limit: usize,
    pub default_limit: usize,
    pub last_speed_sample: Option<f64>,
    pub recovery_armed: bool,
    pub in_flight: usize,
}

/// 自适应并发控制器
#[derive(Debug)]
pub struct ConcurrencyController {
    /// 当前并发上限
    current_limit: AtomicUsize,
    /// 默认并发数（来自配置）
    default_limit: usize,
    /// 是否启用自适应调整
    adaptive: bool,
    /// 最近一次速度样本 (MB/s)
    last_speed_sample: Mutex<Option<f64>>,
    /// 恢复探测定时器是否已就绪
    recovery_armed: AtomicBool,
    /// 上次安排恢复探测的时间
    last_probe_at: Mutex<Option<Instant>>,
    /// 恢复探测定时器句柄
    recovery_timer: Mutex<Option<JoinHandle<()>>>,
    /// 所有会话正在传输的分片数
    in_flight: AtomicUsize,
    /// 槽位释放 / 上限提高时唤醒等待者
    slot_freed: Notify,
}

impl ConcurrencyController {
    /// 创建控制器
    ///
    /// # 参数
    /// * `default_limit` - 配置的最大并发数
    /// * `adaptive` - 是否根据速度样本自适应调整
    /// * `hint` - 网络质量提示（可选）
    pub fn new(default_limit: usize, adaptive: bool, hint: Option<NetworkQuality>) -> Arc<Self> {
        let default_limit = default_limit.max(1);
        let current = initial_limit(default_limit, hint);

        info!(
            "创建并发控制器: 默认并发={}, 初始并发={}, 自适应={}, 网络提示={:?}",
            default_limit, current, adaptive, hint
        );

        Arc::new(Self {
            current_limit: AtomicUsize::new(current),
            default_limit,
            adaptive,
            last_speed_sample: Mutex::new(None),
            recovery_armed: AtomicBool::new(false),
            last_probe_at: Mutex::new(None),
            recovery_timer: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            slot_freed: Notify::new(),
        })
    }

    /// 使用网络探测结果创建控制器
    pub fn with_probe(
        default_limit: usize,
        adaptive: bool,
        probe: Option<&dyn NetworkProbe>,
    ) -> Arc<Self> {
        Self::new(default_limit, adaptive, probe.and_then(|p| p.sample()))
    }

    /// 当前并发上限
    pub fn current_limit(&self) -> usize {
        self.current_limit.load(Ordering::SeqCst)
    }

    /// 默认并发数
    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// 并发上限的天花板（默认值的 2 倍）
    pub fn ceiling(&self) -> usize {
        self.default_limit * 2
    }

    /// 当前正在传输的分片数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 状态快照
    pub fn snapshot(&self) -> ConcurrencyState {
        ConcurrencyState {
            current_limit: self.current_limit(),
            default_limit: self.default_limit,
            last_speed_sample: *self.last_speed_sample.lock(),
            recovery_armed: self.recovery_armed.load(Ordering::SeqCst),
            in_flight: self.in_flight(),
        }
    }

    /// 记录速度样本并调整并发上限
    ///
    /// # 参数
    /// * `speed_mbs` - 最近观测到的上传速度 (MB/s)
    pub fn record_sample(self: &Arc<Self>, speed_mbs: f64) {
        *self.last_speed_sample.lock() = Some(speed_mbs);

        if !self.adaptive {
            return;
        }

        let current = self.current_limit();
        let per_connection = speed_mbs / current as f64;

        if per_connection < DECREASE_THRESHOLD_MBS && current > MIN_ADAPTIVE_LIMIT {
            self.set_limit(current, current - 1, "单连接速度过低");
        } else if per_connection > IDEAL_PER_CONNECTION_MBS
            && speed_mbs > INCREASE_THRESHOLD_MBS
            && current < self.ceiling()
        {
            self.set_limit(current, current + 1, "带宽充足");
        }

        self.maybe_arm_recovery_probe();
    }

    fn set_limit(&self, old: usize, new: usize, reason: &str) {
        if self
            .current_limit
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("🔧 调整上传并发数: {} -> {} ({})", old, new, reason);
            if new > old {
                self.slot_freed.notify_waiters();
            }
        }
    }

    /// 恢复探测：每个窗口最多安排一次，定时器到期后 limit + 1
    fn maybe_arm_recovery_probe(self: &Arc<Self>) {
        {
            let mut last_probe = self.last_probe_at.lock();
            if let Some(at) = *last_probe {
                if at.elapsed() < RECOVERY_PROBE_WINDOW {
                    return;
                }
            }
            if self
                .recovery_armed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            *last_probe = Some(Instant::now());
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.recovery_armed.store(false, Ordering::SeqCst);
            return;
        };

        debug!("安排并发恢复探测: {:?} 后执行", RECOVERY_PROBE_WINDOW);

        let controller = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(RECOVERY_PROBE_WINDOW).await;
            if let Some(controller) = controller.upgrade() {
                controller.run_recovery_probe();
            }
        });

        *self.recovery_timer.lock() = Some(handle);
    }

    fn run_recovery_probe(&self) {
        self.recovery_armed.store(false, Ordering::SeqCst);
        self.recovery_timer.lock().take();

        let current = self.current_limit();
        if current < self.ceiling() {
            self.set_limit(current, current + 1, "恢复探测");
        }
    }

    /// 获取一个传输槽位
    ///
    /// 所有会话共享，在途传输数达到当前上限时等待
    pub async fn acquire(self: &Arc<Self>) -> TransferPermit {
        loop {
            let notified = self.slot_freed.notified();
            let active = self.in_flight.load(Ordering::SeqCst);
            if active < self.current_limit() {
                if self
                    .in_flight
                    .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return TransferPermit {
                        controller: Arc::clone(self),
                    };
                }
                continue;
            }
            notified.await;
        }
    }

    /// 取消恢复探测定时器
    pub fn shutdown(&self) {
        if let Some(handle) = self.recovery_timer.lock().take() {
            handle.abort();
        }
        self.recovery_armed.store(false, Ordering::SeqCst);
    }
}

/// 传输槽位（RAII），释放时归还槽位
#[derive(Debug)]
pub struct TransferPermit {
    controller: Arc<ConcurrencyController>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.controller.slot_freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality(effective_type: EffectiveConnectionType, downlink_mbps: f64) -> NetworkQuality {
        NetworkQuality {
            effective_type,
            downlink_mbps,
        }
    }

    #[test]
    fn test_initial_limit_from_hint() {
        assert_eq!(initial_limit(5, None), 5);
        assert_eq!(
            initial_limit(5, Some(quality(EffectiveConnectionType::FourG, 20.0))),
            10
        );
        assert_eq!(
            initial_limit(5, Some(quality(EffectiveConnectionType::FourG, 5.0))),
            5
        );
        assert_eq!(
            initial_limit(5, Some(quality(EffectiveConnectionType::ThreeG, 5.0))),
            2
        );
        assert_eq!(
            initial_limit(1, Some(quality(EffectiveConnectionType::ThreeG, 0.5))),
            1
        );
        assert_eq!(
            initial_limit(8, Some(quality(EffectiveConnectionType::Slow2g, 0.1))),
            1
        );
        assert_eq!(
            initial_limit(8, Some(quality(EffectiveConnectionType::TwoG, 0.3))),
            1
        );
    }

    #[test]
    fn test_parse_connection_type() {
        assert_eq!(
            EffectiveConnectionType::parse("slow-2g"),
            Some(EffectiveConnectionType::Slow2g)
        );
        assert_eq!(
            EffectiveConnectionType::parse("4G"),
            Some(EffectiveConnectionType::FourG)
        );
        assert_eq!(EffectiveConnectionType::parse("5g"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_samples_increase_up_to_ceiling() {
        let controller = ConcurrencyController::new(5, true, None);
        controller.record_sample(30.0);
        assert_eq!(controller.current_limit(), 6);

        for _ in 0..20 {
            controller.record_sample(100.0);
        }
        assert_eq!(controller.current_limit(), 10);
        controller.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_samples_decrease_down_to_floor() {
        let controller = ConcurrencyController::new(5, true, None);
        controller.record_sample(5.0);
        assert_eq!(controller.current_limit(), 4);

        for _ in 0..10 {
            controller.record_sample(0.5);
        }
        assert_eq!(controller.current_limit(), 2);
        controller.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_adaptive_keeps_limit() {
        let controller = ConcurrencyController::new(5, false, None);
        controller.record_sample(100.0);
        controller.record_sample(0.1);
        assert_eq!(controller.current_limit(), 5);
        assert_eq!(controller.snapshot().last_speed_sample, Some(0.1));
        assert!(!controller.snapshot().recovery_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_probe_increments_once_per_window() {
        let controller = ConcurrencyController::new(5, true, None);
        // 4 MB/s: 单连接 0.8 < 2，降到 4
        controller.record_sample(4.0);
        assert_eq!(controller.current_limit(), 4);
        assert!(controller.snapshot().recovery_armed);

        // 窗口内再次采样不会重复安排探测（单连接 2.5 MB/s，不增不减）
        controller.record_sample(10.0);
        assert_eq!(controller.current_limit(), 4);

        tokio::time::sleep(RECOVERY_PROBE_WINDOW + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(controller.current_limit(), 5);
        assert!(!controller.snapshot().recovery_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_recovery_probe() {
        let controller = ConcurrencyController::new(5, true, None);
        controller.record_sample(4.0);
        assert_eq!(controller.current_limit(), 4);

        controller.shutdown();
        tokio::time::sleep(RECOVERY_PROBE_WINDOW * 2).await;
        assert_eq!(controller.current_limit(), 4);
    }

    #[tokio::test]
    async fn test_permits_bound_in_flight() {
        let controller = ConcurrencyController::new(2, false, None);
        let p1 = controller.acquire().await;
        let _p2 = controller.acquire().await;
        assert_eq!(controller.in_flight(), 2);

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let _p3 = controller.acquire().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.in_flight(), 1);
    }
}

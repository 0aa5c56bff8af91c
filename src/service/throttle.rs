//! 进度事件节流
//!
//! 每个 Loader 一个节流器，避免高速传输时事件风暴。
//! 完成（fraction 到 1.0）的那一次总是放行。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 尚未发布过
const NEVER: u64 = u64::MAX;

#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次发布距起点的纳秒数
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次发布已超过间隔时返回 true 并记录本次
    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 相对进度：完成时强制放行
    pub fn should_emit_fraction(&self, fraction: f64) -> bool {
        if fraction >= 1.0 {
            return self.force_emit();
        }
        self.should_emit()
    }

    /// 不检查间隔，直接记录本次发布
    pub fn force_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64;
        self.last_emit_nanos.store(now, Ordering::Relaxed);
        true
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(NEVER, Ordering::Relaxed);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

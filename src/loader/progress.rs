//! 速度与剩余时间估算

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 默认滑动窗口
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// 滑动窗口速度计算器
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 记录新写入的字节数
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    pub(crate) fn add_sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some((t, _)) = self.samples.front() {
            if at.duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0;
        }
        // 第一个样本是窗口起点，其字节数不计入区间
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| *b).sum();
        (bytes as f64 / span) as u64
    }

    /// 剩余时间（秒），速度未知时为 None
    pub fn eta(&self, remaining: u64) -> Option<u64> {
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        Some(remaining.div_ceil(speed))
    }
}

/// 单个传输的字节进度
#[derive(Debug, Clone)]
pub struct ByteProgress {
    total: Option<u64>,
    done: u64,
    speed: SpeedCalculator,
}

impl ByteProgress {
    /// `already` 为续传时已存在的字节数
    pub fn new(total: Option<u64>, already: u64) -> Self {
        let mut speed = SpeedCalculator::with_default_window();
        speed.add_sample(0);
        Self {
            total,
            done: already,
            speed,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        self.speed.add_sample(bytes);
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// 完成比例，长度未知时为 None
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.done as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    pub fn eta(&self) -> Option<u64> {
        let total = self.total?;
        self.speed.eta(total.saturating_sub(self.done))
    }
}

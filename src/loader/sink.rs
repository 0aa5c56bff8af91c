//! 进度上报
//!
//! Loader 只依赖 `ProgressSink`，协调器提供基于通道的 `LoaderReporter`。
//! 所有 Loader 共用一个无界通道，由协调器的单个事件循环消费，
//! 因此同一个 Loader 的事件保持顺序，且 `Finished` 一定是最后一条。

use crate::loader::LoaderId;
use crate::model::Delivery;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// 进度接收方
///
/// 所有方法都有空实现，测试中可以只覆盖关心的回调
pub trait ProgressSink: Send + Sync {
    /// 缓冲中（0-100）
    fn on_buffering(&self, _percent: u8) {}

    /// 得知内容总长度
    fn on_content_length(&self, _bytes: u64) {}

    /// 相对进度（0.0-1.0）
    fn on_progress(&self, _fraction: f64, _eta_secs: Option<u64>) {}

    /// 绝对进度（流媒体，毫秒）
    fn on_absolute_progress(&self, _elapsed_ms: u64, _total_ms: Option<u64>, _eta_secs: Option<u64>) {}

    /// 长度未知，无法给出进度
    fn on_no_progress_available(&self) {}

    /// 检测到直播流（无固定终点）
    fn on_live_stream_detected(&self) {}

    /// 服务器给出了资源名
    fn on_resource_name_resolved(&self, _name: &str) {}

    /// 状态文本
    fn on_status_message(&self, _text: &str, _is_error: bool) {}

    /// 执行结束，每个 Order 一个 Delivery
    fn on_finished(&self, _deliveries: Vec<Delivery>) {}
}

/// Loader 事件
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    Buffering(u8),
    ContentLength(u64),
    Progress {
        fraction: f64,
        eta_secs: Option<u64>,
    },
    AbsoluteProgress {
        elapsed_ms: u64,
        total_ms: Option<u64>,
        eta_secs: Option<u64>,
    },
    NoProgressAvailable,
    LiveStreamDetected,
    ResourceNameResolved(String),
    StatusMessage {
        text: String,
        is_error: bool,
    },
    Finished(Vec<Delivery>),
}

/// 通道消息
#[derive(Debug, Clone)]
pub struct LoaderMessage {
    pub id: LoaderId,
    pub event: LoaderEvent,
}

/// 基于通道的进度上报器
///
/// 相对进度在这里被钳制为单调不减
#[derive(Debug)]
pub struct LoaderReporter {
    id: LoaderId,
    tx: mpsc::UnboundedSender<LoaderMessage>,
    last_fraction: Mutex<f64>,
}

impl LoaderReporter {
    pub fn new(id: LoaderId, tx: mpsc::UnboundedSender<LoaderMessage>) -> Self {
        Self {
            id,
            tx,
            last_fraction: Mutex::new(0.0),
        }
    }

    fn send(&self, event: LoaderEvent) {
        // 接收端关闭说明协调器已经停止，丢弃即可
        let _ = self.tx.send(LoaderMessage { id: self.id, event });
    }
}

impl ProgressSink for LoaderReporter {
    fn on_buffering(&self, percent: u8) {
        self.send(LoaderEvent::Buffering(percent.min(100)));
    }

    fn on_content_length(&self, bytes: u64) {
        self.send(LoaderEvent::ContentLength(bytes));
    }

    fn on_progress(&self, fraction: f64, eta_secs: Option<u64>) {
        let fraction = {
            let mut last = self.last_fraction.lock();
            let clamped = if fraction.is_finite() {
                fraction.clamp(0.0, 1.0).max(*last)
            } else {
                *last
            };
            *last = clamped;
            clamped
        };
        self.send(LoaderEvent::Progress { fraction, eta_secs });
    }

    fn on_absolute_progress(&self, elapsed_ms: u64, total_ms: Option<u64>, eta_secs: Option<u64>) {
        self.send(LoaderEvent::AbsoluteProgress {
            elapsed_ms,
            total_ms,
            eta_secs,
        });
    }

    fn on_no_progress_available(&self) {
        self.send(LoaderEvent::NoProgressAvailable);
    }

    fn on_live_stream_detected(&self) {
        self.send(LoaderEvent::LiveStreamDetected);
    }

    fn on_resource_name_resolved(&self, name: &str) {
        self.send(LoaderEvent::ResourceNameResolved(name.to_string()));
    }

    fn on_status_message(&self, text: &str, is_error: bool) {
        self.send(LoaderEvent::StatusMessage {
            text: text.to_string(),
            is_error,
        });
    }

    fn on_finished(&self, deliveries: Vec<Delivery>) {
        self.send(LoaderEvent::Finished(deliveries));
    }
}

/// 什么都不做的接收方
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_never_decreases() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = LoaderReporter::new(LoaderId(4096), tx);

        reporter.on_progress(0.5, None);
        reporter.on_progress(0.3, None);
        reporter.on_progress(f64::NAN, None);
        reporter.on_progress(1.7, Some(0));

        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(msg.id, LoaderId(4096));
            if let LoaderEvent::Progress { fraction, .. } = msg.event {
                seen.push(fraction);
            }
        }
        assert_eq!(seen, vec![0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let reporter = LoaderReporter::new(LoaderId(1), tx);
        reporter.on_status_message("still fine", false);
        reporter.on_finished(Vec::new());
    }
}

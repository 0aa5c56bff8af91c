//! 服务事件与订阅
//!
//! 订阅方显式 subscribe / unsubscribe；接收端关闭后在下一次发布时被清理

use crate::loader::LoaderId;
use crate::model::{GroupId, LoaderKind, Order, ResultCode, Wish};
use crate::service::recovery::Classification;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// 服务事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ServiceEvent {
    /// Loader 已派发
    Dispatched {
        id: LoaderId,
        kind: LoaderKind,
        order_ids: Vec<String>,
        destinations: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<GroupId>,
    },
    Buffering {
        id: LoaderId,
        percent: u8,
    },
    ContentLength {
        id: LoaderId,
        bytes: u64,
    },
    /// 相对进度（已节流）
    Progress {
        id: LoaderId,
        fraction: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_secs: Option<u64>,
    },
    /// 绝对进度（已节流）
    AbsoluteProgress {
        id: LoaderId,
        elapsed_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_secs: Option<u64>,
    },
    NoProgressAvailable {
        id: LoaderId,
    },
    LiveStreamDetected {
        id: LoaderId,
    },
    ResourceNameResolved {
        id: LoaderId,
        name: String,
    },
    StatusMessage {
        id: LoaderId,
        text: String,
        is_error: bool,
    },
    /// 单个 Order 的最终结果
    Finished {
        id: LoaderId,
        order: Order,
        code: ResultCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<PathBuf>,
        classification: Classification,
    },
    /// 下载组全部结束
    GroupSummary {
        group: GroupId,
        total: usize,
        succeeded: usize,
        failed: usize,
        /// 组内数量不超过 20 时提供紧凑计数
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compact_counter: Option<u32>,
    },
    /// 队列中的 Wish 无法派发，已被丢弃
    DispatchFailed {
        wish: Wish,
        reason: String,
    },
    /// 没有任何 Loader 在运行
    Idle,
}

impl ServiceEvent {
    /// 事件所属的 Loader
    pub fn loader_id(&self) -> Option<LoaderId> {
        match self {
            ServiceEvent::Dispatched { id, .. }
            | ServiceEvent::Buffering { id, .. }
            | ServiceEvent::ContentLength { id, .. }
            | ServiceEvent::Progress { id, .. }
            | ServiceEvent::AbsoluteProgress { id, .. }
            | ServiceEvent::NoProgressAvailable { id }
            | ServiceEvent::LiveStreamDetected { id }
            | ServiceEvent::ResourceNameResolved { id, .. }
            | ServiceEvent::StatusMessage { id, .. }
            | ServiceEvent::Finished { id, .. } => Some(*id),
            ServiceEvent::GroupSummary { .. }
            | ServiceEvent::DispatchFailed { .. }
            | ServiceEvent::Idle => None,
        }
    }
}

/// 单个 Loader 的进度展示状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSurface {
    pub id: LoaderId,
    pub kind: LoaderKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    /// 无法给出进度
    pub indeterminate: bool,
    /// 直播流：提供"结束"而不是"取消"
    pub stop_offered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub is_error: bool,
}

impl ProgressSurface {
    pub fn new(id: LoaderId, kind: LoaderKind, title: impl Into<String>, group: Option<GroupId>) -> Self {
        Self {
            id,
            kind,
            title: title.into(),
            group,
            content_length: None,
            fraction: None,
            elapsed_ms: None,
            total_ms: None,
            eta_secs: None,
            indeterminate: false,
            stop_offered: false,
            status_text: None,
            is_error: false,
        }
    }
}

/// 订阅ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 事件分发
#[derive(Debug, Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<ServiceEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ServiceEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    /// 发布给所有订阅方，已关闭的接收端顺带移除
    pub fn publish(&self, event: ServiceEvent) {
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

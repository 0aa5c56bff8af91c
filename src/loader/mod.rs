//! Loader 抽象
//!
//! 每个 Loader 变体负责一种传输方式，由 `LoaderKind::select` 纯函数选出，
//! 以 `Worker` 的形式在 tokio 运行时上执行。
//! Worker 把每个 Order 的结果转成恰好一个 Delivery，最后一次性上报。

pub mod error;
pub mod http;
pub mod local;
pub mod progress;
pub mod session;
pub mod sink;
pub mod storage;
pub mod transcode;

pub use error::LoaderError;
pub use http::HttpLoader;
pub use local::LocalCopyLoader;
pub use progress::{ByteProgress, SpeedCalculator};
pub use session::{RemoteSession, SessionConnector, SessionLoader, SessionProtocol};
pub use sink::{LoaderEvent, LoaderMessage, LoaderReporter, NullSink, ProgressSink};
pub use transcode::TranscodeLoader;

use crate::config::TranscodeConfig;
use crate::model::{Delivery, LoaderKind, Order};
use crate::service::contracts::{AuthManager, HostPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Loader 标识（由协调器的分配器发放）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoaderId(pub u32);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader-{}", self.0)
    }
}

/// 停止原因（先到先得）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    None = 0,
    Cancel = 1,
    HoldOn = 2,
    Defer = 3,
    FinishLive = 4,
}

impl StopReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StopReason::Cancel,
            2 => StopReason::HoldOn,
            3 => StopReason::Defer,
            4 => StopReason::FinishLive,
            _ => StopReason::None,
        }
    }
}

/// Worker 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LoaderStatus {
    Pending = 0,
    Running = 1,
    Finished = 2,
}

impl LoaderStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoaderStatus::Running,
            2 => LoaderStatus::Finished,
            _ => LoaderStatus::Pending,
        }
    }
}

/// 停止请求与取消令牌
#[derive(Debug)]
pub struct LoaderControl {
    reason: AtomicU8,
    status: AtomicU8,
    token: CancellationToken,
}

impl LoaderControl {
    pub fn new() -> Self {
        Self {
            reason: AtomicU8::new(StopReason::None as u8),
            status: AtomicU8::new(LoaderStatus::Pending as u8),
            token: CancellationToken::new(),
        }
    }

    /// 记录停止请求
    ///
    /// 只有第一个请求生效；已结束的 Worker 不再接受请求
    pub fn request(&self, reason: StopReason) -> bool {
        if self.status() == LoaderStatus::Finished || reason == StopReason::None {
            return false;
        }
        let accepted = self
            .reason
            .compare_exchange(
                StopReason::None as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if accepted {
            self.token.cancel();
        }
        accepted
    }

    pub fn reason(&self) -> StopReason {
        StopReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn status(&self) -> LoaderStatus {
        LoaderStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: LoaderStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 停止原因对应的错误
    ///
    /// 不支持手动结束的变体把 FinishLive 当作取消
    pub fn stop_error(&self) -> LoaderError {
        match self.reason() {
            StopReason::HoldOn => LoaderError::HeldOn,
            StopReason::Defer => LoaderError::Deferred,
            StopReason::Cancel | StopReason::FinishLive | StopReason::None => LoaderError::Cancelled,
        }
    }
}

impl Default for LoaderControl {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次成功传输的结果
#[derive(Debug, Clone)]
pub struct Transferred {
    pub file: PathBuf,
    pub bytes: u64,
    pub media_type: Option<String>,
}

/// Loader 运行所需的共享资源
#[derive(Clone)]
pub struct LoaderContext {
    pub client: reqwest::Client,
    pub host_policy: Arc<dyn HostPolicy>,
    pub auth: Arc<dyn AuthManager>,
    pub sessions: Option<Arc<dyn SessionConnector>>,
    pub transcode: TranscodeConfig,
    /// 写入后至少保留的空间
    pub min_free_space: u64,
    /// 单次读取超时
    pub read_timeout: Duration,
}

/// Loader 变体（封闭集合）
pub enum LoaderVariant {
    Http(HttpLoader),
    Ftp(SessionLoader),
    Sftp(SessionLoader),
    LocalCopy(LocalCopyLoader),
    Transcode(TranscodeLoader),
}

impl LoaderVariant {
    pub fn build(kind: LoaderKind, ctx: &LoaderContext) -> Self {
        match kind {
            LoaderKind::Http => LoaderVariant::Http(HttpLoader::new(ctx)),
            LoaderKind::Ftp => LoaderVariant::Ftp(SessionLoader::new(SessionProtocol::Ftp, ctx)),
            LoaderKind::Sftp => LoaderVariant::Sftp(SessionLoader::new(SessionProtocol::Sftp, ctx)),
            LoaderKind::LocalCopy => LoaderVariant::LocalCopy(LocalCopyLoader::new()),
            LoaderKind::Transcode => LoaderVariant::Transcode(TranscodeLoader::new(&ctx.transcode)),
        }
    }

    pub fn kind(&self) -> LoaderKind {
        match self {
            LoaderVariant::Http(_) => LoaderKind::Http,
            LoaderVariant::Ftp(_) => LoaderKind::Ftp,
            LoaderVariant::Sftp(_) => LoaderKind::Sftp,
            LoaderVariant::LocalCopy(_) => LoaderKind::LocalCopy,
            LoaderVariant::Transcode(_) => LoaderKind::Transcode,
        }
    }

    async fn fetch(
        &self,
        order: &Order,
        control: &LoaderControl,
        sink: &dyn ProgressSink,
    ) -> Result<Transferred, LoaderError> {
        match self {
            LoaderVariant::Http(loader) => loader.fetch(order, control, sink).await,
            LoaderVariant::Ftp(loader) | LoaderVariant::Sftp(loader) => {
                loader.fetch(order, control, sink).await
            }
            LoaderVariant::LocalCopy(loader) => loader.fetch(order, control, sink).await,
            LoaderVariant::Transcode(loader) => loader.fetch(order, control, sink).await,
        }
    }
}

/// 一个 Loader 实例
pub struct Worker {
    id: LoaderId,
    orders: Vec<Order>,
    variant: LoaderVariant,
    control: LoaderControl,
    started: AtomicBool,
}

impl Worker {
    pub fn new(id: LoaderId, orders: Vec<Order>, variant: LoaderVariant) -> Self {
        Self {
            id,
            orders,
            variant,
            control: LoaderControl::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn kind(&self) -> LoaderKind {
        self.variant.kind()
    }

    pub fn status(&self) -> LoaderStatus {
        self.control.status()
    }

    pub fn current_orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn stop_reason(&self) -> StopReason {
        self.control.reason()
    }

    pub fn cancel(&self) -> bool {
        self.request(StopReason::Cancel)
    }

    /// 暂停：结束后 Order 保留，等待网络恢复后续传
    pub fn hold_on(&self) -> bool {
        self.request(StopReason::HoldOn)
    }

    /// 推迟：结束后 Wish 以 held 状态重新排队
    pub fn defer(&self) -> bool {
        self.request(StopReason::Defer)
    }

    /// 手动结束直播捕获，已捕获的内容视为成功
    pub fn finish_live(&self) -> bool {
        self.request(StopReason::FinishLive)
    }

    fn request(&self, reason: StopReason) -> bool {
        let accepted = self.control.request(reason);
        if accepted {
            info!("{} 收到停止请求: {:?}", self.id, reason);
        } else {
            debug!("{} 忽略停止请求: {:?} (status={:?})", self.id, reason, self.status());
        }
        accepted
    }

    /// 在运行时上启动，只能启动一次
    pub fn start(self: &Arc<Self>, sink: Arc<dyn ProgressSink>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return None;
        }
        let worker = Arc::clone(self);
        Some(tokio::spawn(async move { worker.drive(sink).await }))
    }

    async fn drive(self: Arc<Self>, sink: Arc<dyn ProgressSink>) {
        self.control.set_status(LoaderStatus::Running);
        debug!("{} 开始执行: kind={:?}, orders={}", self.id, self.kind(), self.orders.len());

        let inner = {
            let worker = Arc::clone(&self);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { worker.execute(sink.as_ref()).await })
        };

        let deliveries = match inner.await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!("{} 执行任务异常退出: {}", self.id, e);
                self.orders
                    .iter()
                    .map(|order| {
                        Delivery::failure(
                            order.clone(),
                            LoaderError::Internal(format!("loader task aborted: {}", e)),
                        )
                    })
                    .collect()
            }
        };

        self.control.set_status(LoaderStatus::Finished);
        sink.on_finished(deliveries);
    }

    async fn execute(&self, sink: &dyn ProgressSink) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(self.orders.len());
        for order in &self.orders {
            if self.control.is_stopped() {
                deliveries.push(Delivery::failure(order.clone(), self.control.stop_error()));
                continue;
            }

            let delivery = match self.variant.fetch(order, &self.control, sink).await {
                Ok(done) => {
                    info!(
                        "{} 完成: {:?}, {} bytes",
                        self.id, done.file, done.bytes
                    );
                    Delivery::success(order.clone(), done.file, done.bytes)
                        .with_media_type(done.media_type)
                }
                Err(e) => {
                    if matches!(
                        e,
                        LoaderError::Cancelled | LoaderError::Deferred | LoaderError::HeldOn
                    ) {
                        debug!("{} 已停止: {}", self.id, e);
                    } else {
                        error!("{} 失败: source={}, 错误: {}", self.id, order.source, e);
                    }
                    Delivery::failure(order.clone(), e)
                }
            };
            deliveries.push(delivery);
        }
        deliveries
    }
}

//! 下载协调器
//!
//! 负责 Wish → Order 的解析、Loader 的派发与生命周期、结果分类、
//! 下载组统计，以及空闲时从等待队列取下一个任务。
//!
//! 所有 Loader 的事件经同一个通道进入单个事件循环处理。
//! 每张表各自一把锁，任何代码路径都不会同时持有两把。

use crate::config::{AppConfig, NetworkConfig};
use crate::loader::{
    LoaderContext, LoaderError, LoaderEvent, LoaderId, LoaderMessage, LoaderReporter,
    LoaderVariant, Worker,
};
use crate::model::{AuthHint, Delivery, GroupId, LoaderKind, Order, Wish};
use crate::queue::{QueueManager, WishDispatcher};
use crate::service::contracts::{
    AllowAllHosts, AuthManager, CollisionResolver, Credentials, HostPolicy, MemoryAuthManager,
    ProxySelector, SessionConnector, SuffixResolver, WakeLock,
};
use crate::service::events::{EventHub, ProgressSurface, ServiceEvent, SubscriptionId};
use crate::service::identity::{LoaderIdAllocator, DEFAULT_ID_RANGE};
use crate::service::keep_alive::{KeepAlive, NoopWakeLock};
use crate::service::naming;
use crate::service::recovery::{self, Outcome, RecoveryContext};
use crate::service::throttle::ProgressThrottler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, Proxy, Url};
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 组内数量不超过此值时提供紧凑计数
const COMPACT_GROUP_LIMIT: usize = 20;

/// 转码输出缺少扩展名时使用的容器
const DEFAULT_CAPTURE_EXTENSION: &str = "mp4";

/// 分配标识时最多跳过的占用数
const MAX_ID_SKIPS: usize = 64;

/// 停止后等待 Loader 交付结果的最长时间
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 进度展示状态及其节流器
struct SurfaceEntry {
    surface: ProgressSurface,
    throttler: ProgressThrottler,
}

/// 下载组统计
#[derive(Debug, Default)]
struct GroupTally {
    total: usize,
    finished: usize,
    succeeded: usize,
    failed: usize,
}

pub struct LoaderServiceBuilder {
    config: AppConfig,
    host_policy: Option<Arc<dyn HostPolicy>>,
    auth: Option<Arc<dyn AuthManager>>,
    sessions: Option<Arc<dyn SessionConnector>>,
    resolver: Option<Arc<dyn CollisionResolver>>,
    wake_lock: Option<Arc<dyn WakeLock>>,
    proxy: Option<Arc<dyn ProxySelector>>,
    id_range: Range<u32>,
}

impl LoaderServiceBuilder {
    pub fn host_policy(mut self, policy: Arc<dyn HostPolicy>) -> Self {
        self.host_policy = Some(policy);
        self
    }

    pub fn auth_manager(mut self, auth: Arc<dyn AuthManager>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn session_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.sessions = Some(connector);
        self
    }

    pub fn collision_resolver(mut self, resolver: Arc<dyn CollisionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn wake_lock(mut self, lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = Some(lock);
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy = Some(selector);
        self
    }

    pub fn id_range(mut self, range: Range<u32>) -> Self {
        self.id_range = range;
        self
    }

    /// 构建服务并启动事件循环（必须在 tokio 运行时内调用）
    pub fn build(self) -> Result<LoaderService> {
        self.config
            .download
            .validate_download_dir()
            .context("下载根目录无效")?;

        let client = build_client(&self.config.network, self.proxy)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            download_root: self.config.download.download_dir.clone(),
            ids: LoaderIdAllocator::new(self.id_range),
            workers: RwLock::new(HashMap::new()),
            surfaces: DashMap::new(),
            groups: Mutex::new(HashMap::new()),
            next_group: AtomicU32::new(1),
            reservations: Mutex::new(HashMap::new()),
            held_orders: Mutex::new(Vec::new()),
            queue: QueueManager::new(),
            events: EventHub::new(),
            keep_alive: KeepAlive::new(self.wake_lock.unwrap_or_else(|| Arc::new(NoopWakeLock))),
            client: RwLock::new(client),
            host_policy: self.host_policy.unwrap_or_else(|| Arc::new(AllowAllHosts)),
            auth: self.auth.unwrap_or_else(|| Arc::new(MemoryAuthManager::new())),
            sessions: self.sessions,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(SuffixResolver::default())),
            tx,
            shutdown: shutdown.clone(),
            config: self.config,
        });

        tokio::spawn(run_event_loop(Arc::clone(&inner), rx, shutdown));
        info!("下载服务已启动，下载根目录: {:?}", inner.download_root);

        Ok(LoaderService { inner })
    }
}

/// 下载服务句柄
///
/// 句柄被丢弃时取消所有 Loader 并停止事件循环
pub struct LoaderService {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    download_root: PathBuf,
    ids: LoaderIdAllocator,
    workers: RwLock<HashMap<LoaderId, Arc<Worker>>>,
    surfaces: DashMap<LoaderId, SurfaceEntry>,
    groups: Mutex<HashMap<GroupId, GroupTally>>,
    next_group: AtomicU32,
    /// 目标路径 → 占用它的 Order ID（在途或暂停待续传）
    reservations: Mutex<HashMap<PathBuf, String>>,
    /// 暂停后等待续传的 Order
    held_orders: Mutex<Vec<Order>>,
    queue: QueueManager,
    events: EventHub,
    keep_alive: KeepAlive,
    client: RwLock<Client>,
    host_policy: Arc<dyn HostPolicy>,
    auth: Arc<dyn AuthManager>,
    sessions: Option<Arc<dyn SessionConnector>>,
    resolver: Arc<dyn CollisionResolver>,
    tx: mpsc::UnboundedSender<LoaderMessage>,
    shutdown: CancellationToken,
}

fn build_client(network: &NetworkConfig, selector: Option<Arc<dyn ProxySelector>>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(network.user_agent.as_str())
        .connect_timeout(network.connect_timeout())
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(network.max_redirects));

    if let Some(selector) = selector {
        builder = builder.proxy(Proxy::custom(move |url| {
            selector
                .proxy_for(url)
                .and_then(|proxy| Url::parse(&proxy).ok())
        }));
    } else if let Some(proxy) = &network.proxy {
        builder = builder.proxy(Proxy::all(proxy.as_str()).context("代理地址无效")?);
    }

    builder.build().context("构建 HTTP 客户端失败")
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<LoaderMessage>,
    shutdown: CancellationToken,
) {
    debug!("事件循环启动");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => inner.handle_message(msg).await,
                None => break,
            },
        }
    }

    // 已取消的 Loader 仍需交付结果，才能释放常亮锁和路径占用
    let pending = inner.active_count();
    if pending > 0 {
        debug!("等待 {} 个 Loader 结束", pending);
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while inner.active_count() > 0 {
                match rx.recv().await {
                    Some(msg) => inner.handle_message(msg).await,
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            inner.abandon_workers();
        }
    }
    debug!("事件循环退出");
}

impl LoaderService {
    pub fn builder(config: AppConfig) -> LoaderServiceBuilder {
        LoaderServiceBuilder {
            config,
            host_policy: None,
            auth: None,
            sessions: None,
            resolver: None,
            wake_lock: None,
            proxy: None,
            id_range: DEFAULT_ID_RANGE,
        }
    }

    /// 使用默认协作方构建
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// 立即派发一个 Wish
    pub async fn submit(&self, wish: Wish) -> Result<LoaderId> {
        self.inner.submit(wish).await
    }

    /// 派发一个已解析的 Order
    pub async fn submit_order(&self, order: Order) -> Result<LoaderId> {
        self.inner.submit_order(order).await
    }

    /// 派发一组 Wish，本地复制的合并为一个 Loader
    pub async fn submit_group(&self, wishes: Vec<Wish>) -> Result<(GroupId, Vec<LoaderId>)> {
        self.inner.submit_group(wishes).await
    }

    /// 未达到并发上限时立即派发，否则排队
    pub async fn submit_or_queue(&self, wish: Wish) -> Result<Option<LoaderId>> {
        if wish.held || self.active_count() >= self.inner.config.download.max_concurrent_tasks {
            self.inner.queue.add(vec![wish]).await;
            return Ok(None);
        }
        self.submit(wish).await.map(Some)
    }

    pub fn cancel(&self, id: LoaderId) -> bool {
        self.inner.worker(id).is_some_and(|w| w.cancel())
    }

    pub fn hold_on(&self, id: LoaderId) -> bool {
        self.inner.worker(id).is_some_and(|w| w.hold_on())
    }

    pub fn defer(&self, id: LoaderId) -> bool {
        self.inner.worker(id).is_some_and(|w| w.defer())
    }

    pub fn finish_live(&self, id: LoaderId) -> bool {
        self.inner.worker(id).is_some_and(|w| w.finish_live())
    }

    /// 用失败的 Order 重新提交
    pub async fn retry(&self, order: &Order) -> Result<LoaderId> {
        info!("重试: {}", order.source);
        self.submit(order.retry_wish()).await
    }

    /// 保存凭证后重试
    pub async fn retry_with_credentials(
        &self,
        order: &Order,
        realm: &str,
        scheme: &str,
        userid: &str,
        password: &str,
    ) -> Result<LoaderId> {
        self.inner
            .auth
            .store(realm, Credentials::new(scheme, userid, password));
        let mut wish = order.retry_wish();
        wish.auth = Some(AuthHint {
            realm: realm.to_string(),
            scheme: scheme.to_string(),
            userid: Some(userid.to_string()),
        });
        info!("使用 realm \"{}\" 的凭证重试: {}", realm, order.source);
        self.submit(wish).await
    }

    /// 放回等待队列
    pub async fn queue_later(&self, order: &Order) -> bool {
        self.inner.queue.add(vec![order.retry_wish()]).await > 0
    }

    pub async fn unqueue(&self, wishes: &[Wish]) -> usize {
        self.inner.queue.remove(wishes).await
    }

    /// 取消同一主机上排队的下载
    pub async fn unqueue_host(&self, host: &str) -> usize {
        self.inner.queue.remove_for_host(host).await
    }

    /// 删除失败 Order 残留的部分文件
    ///
    /// 目标路径仍被在途 Order 占用时不删除
    pub async fn delete_partial(&self, order: &Order) -> Result<bool> {
        let destination = order.destination();
        if self.inner.reservations.lock().contains_key(&destination) {
            warn!("目标文件仍在使用中，跳过删除: {:?}", destination);
            return Ok(false);
        }
        match tokio::fs::remove_file(&destination).await {
            Ok(()) => {
                info!("已删除部分文件: {:?}", destination);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("删除部分文件失败: {:?}", destination)),
        }
    }

    /// 网络断开：暂停所有网络传输，返回暂停的数量
    pub fn network_lost(&self) -> usize {
        let workers: Vec<Arc<Worker>> = self.inner.workers.read().values().cloned().collect();
        let held = workers
            .iter()
            .filter(|w| w.kind() != LoaderKind::LocalCopy)
            .filter(|w| w.hold_on())
            .count();
        info!("网络断开，暂停 {} 个传输", held);
        held
    }

    /// 网络恢复：续传所有暂停的 Order
    pub async fn network_restored(&self) -> Vec<LoaderId> {
        let held: Vec<Order> = std::mem::take(&mut *self.inner.held_orders.lock());
        info!("网络恢复，续传 {} 个暂停的下载", held.len());

        let mut ids = Vec::with_capacity(held.len());
        for order in held {
            match self.inner.submit_order(order).await {
                Ok(id) => ids.push(id),
                Err(e) => error!("续传失败: {:#}", e),
            }
        }
        ids
    }

    /// 暂停中等待续传的 Order
    pub fn held_orders(&self) -> Vec<Order> {
        self.inner.held_orders.lock().clone()
    }

    /// 从等待队列派发下一个
    pub async fn next_please(&self, force: bool) -> bool {
        self.inner.queue.next_please(self.inner.as_ref(), force).await
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ServiceEvent>) {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// 所有在途 Loader 的进度展示状态
    pub fn surfaces(&self) -> Vec<ProgressSurface> {
        let mut surfaces: Vec<ProgressSurface> = self
            .inner
            .surfaces
            .iter()
            .map(|entry| entry.surface.clone())
            .collect();
        surfaces.sort_by_key(|s| s.id);
        surfaces
    }

    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    pub fn is_active(&self, id: LoaderId) -> bool {
        self.inner.worker(id).is_some()
    }

    pub fn queue(&self) -> &QueueManager {
        &self.inner.queue
    }

    /// 替换代理选择器并重建 HTTP 客户端
    ///
    /// 正在运行的 Loader 继续使用启动时的客户端
    pub fn set_proxy_selector(&self, selector: Option<Arc<dyn ProxySelector>>) -> Result<()> {
        let client = build_client(&self.inner.config.network, selector)?;
        *self.inner.client.write() = client;
        info!("代理设置已更新");
        Ok(())
    }

    /// 取消所有 Loader 并停止事件循环
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for LoaderService {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn worker(&self, id: LoaderId) -> Option<Arc<Worker>> {
        self.workers.read().get(&id).cloned()
    }

    fn active_count(&self) -> usize {
        self.workers.read().len()
    }

    fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let workers: Vec<Arc<Worker>> = self.workers.read().values().cloned().collect();
        for worker in &workers {
            worker.cancel();
        }
        self.shutdown.cancel();
        info!("下载服务已停止，取消 {} 个 Loader", workers.len());
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            anyhow::bail!("下载服务已停止");
        }
        Ok(())
    }

    /// 停止超时后丢弃仍未交付的 Loader
    fn abandon_workers(&self) {
        let abandoned: Vec<Arc<Worker>> = self.workers.write().drain().map(|(_, w)| w).collect();
        for worker in &abandoned {
            self.surfaces.remove(&worker.id());
            for order in worker.current_orders() {
                self.release(&order.destination(), &order.id);
            }
            self.keep_alive.release();
        }
        warn!("{} 个 Loader 未在停止期限内结束，已丢弃", abandoned.len());
    }

    fn loader_context(&self) -> LoaderContext {
        LoaderContext {
            client: self.client.read().clone(),
            host_policy: Arc::clone(&self.host_policy),
            auth: Arc::clone(&self.auth),
            sessions: self.sessions.clone(),
            transcode: self.config.transcode.clone(),
            min_free_space: self.config.download.min_free_space_bytes(),
            read_timeout: self.config.network.read_timeout(),
        }
    }

    /// 路径是否被在途 Order 或磁盘文件占用
    fn is_taken(reservations: &HashMap<PathBuf, String>, path: &Path) -> bool {
        reservations.contains_key(path) || path.exists()
    }

    /// 解决重名并以 owner 的名义登记占用
    fn reserve(&self, candidate: &Path, owner: &str) -> Result<PathBuf> {
        let mut reservations = self.reservations.lock();
        let resolved = {
            let taken = |p: &Path| Self::is_taken(&reservations, p);
            self.resolver.resolve(candidate, &taken)
        }
        .with_context(|| format!("无法为 {:?} 找到可用的文件名", candidate))?;
        reservations.insert(resolved.clone(), owner.to_string());
        Ok(resolved)
    }

    /// 只释放 owner 自己的占用
    fn release(&self, path: &Path, owner: &str) {
        let mut reservations = self.reservations.lock();
        if reservations.get(path).is_some_and(|o| o == owner) {
            reservations.remove(path);
        }
    }

    /// 续传沿用原路径：路径空闲或仍归自己时直接占用
    fn claim(&self, path: &Path, owner: &str, previous: Option<&str>) -> bool {
        let mut reservations = self.reservations.lock();
        let taken = reservations
            .get(path)
            .is_some_and(|current| Some(current.as_str()) != previous && current != owner);
        if taken {
            return false;
        }
        reservations.insert(path.to_path_buf(), owner.to_string());
        true
    }

    /// Wish → Order
    async fn resolve(&self, wish: &Wish, group: Option<GroupId>) -> Result<Order> {
        let kind = wish.kind().ok_or_else(|| LoaderError::UnsupportedScheme {
            uri: wish.uri.clone(),
        })?;

        tokio::fs::create_dir_all(&self.download_root)
            .await
            .with_context(|| format!("无法创建下载目录: {:?}", self.download_root))?;

        let mut name = naming::ensure_extension(&naming::derive_filename(wish), wish.mime.as_deref());
        if kind == LoaderKind::Transcode && !naming::has_extension(&name) {
            name = format!("{}.{}", name, DEFAULT_CAPTURE_EXTENSION);
        }

        let mut order = Order::new(kind, wish.uri.clone(), self.download_root.clone(), name);
        let destination = self.reserve(&order.destination(), &order.id)?;
        if let Some(filename) = destination.file_name() {
            order.filename = filename.to_string_lossy().into_owned();
        }
        order.mime = wish.mime.clone();
        order.expected_size = wish.size;
        order.referer = wish.referer.clone();
        order.aux_urls = wish.aux_uris.clone();
        order.group = group;
        order.wish = Some(wish.clone().held(false));
        order.strip_credentials();

        debug!("解析完成: {} -> {:?} ({:?})", wish.uri, order.destination(), kind);
        Ok(order)
    }

    async fn submit(&self, wish: Wish) -> Result<LoaderId> {
        self.ensure_running()?;
        let order = self.resolve(&wish, None).await?;
        Ok(self.launch(vec![order]))
    }

    async fn submit_order(&self, mut order: Order) -> Result<LoaderId> {
        self.ensure_running()?;
        if order.resume && !self.claim(&order.destination(), &order.id, None) {
            // 原路径已被其他 Order 占用，换新文件名从头下载
            warn!("续传目标已被占用，改为重新下载: {:?}", order.destination());
            order.resume = false;
        }
        if !order.resume {
            let destination = self.reserve(&order.destination(), &order.id)?;
            if let Some(name) = destination.file_name() {
                order.filename = name.to_string_lossy().into_owned();
            }
        }
        Ok(self.launch(vec![order]))
    }

    async fn submit_group(&self, wishes: Vec<Wish>) -> Result<(GroupId, Vec<LoaderId>)> {
        self.ensure_running()?;
        let group = GroupId(self.next_group.fetch_add(1, Ordering::Relaxed));

        let mut orders = Vec::with_capacity(wishes.len());
        for wish in &wishes {
            match self.resolve(wish, Some(group)).await {
                Ok(order) => orders.push(order),
                Err(e) => warn!("{} 中的 {} 无法解析，已跳过: {:#}", group, wish.uri, e),
            }
        }
        if orders.is_empty() {
            anyhow::bail!("{} 中没有可派发的下载", group);
        }

        self.groups.lock().insert(
            group,
            GroupTally {
                total: orders.len(),
                ..GroupTally::default()
            },
        );

        let (local, remote): (Vec<Order>, Vec<Order>) = orders
            .into_iter()
            .partition(|o| o.kind == LoaderKind::LocalCopy);

        let mut ids = Vec::new();
        if !local.is_empty() {
            ids.push(self.launch(local));
        }
        for order in remote {
            ids.push(self.launch(vec![order]));
        }
        info!("{} 已派发: {} 个 Loader", group, ids.len());
        Ok((group, ids))
    }

    fn allocate_id(&self) -> LoaderId {
        let workers = self.workers.read();
        let mut id = self.ids.allocate();
        for _ in 0..MAX_ID_SKIPS {
            if !workers.contains_key(&id) {
                break;
            }
            id = self.ids.allocate();
        }
        id
    }

    /// 创建 Worker 并在运行时上启动
    fn launch(&self, orders: Vec<Order>) -> LoaderId {
        let kind = orders[0].kind;
        let id = self.allocate_id();
        let variant = LoaderVariant::build(kind, &self.loader_context());

        let title = if orders.len() == 1 {
            orders[0].filename.clone()
        } else {
            format!("{} files", orders.len())
        };
        self.surfaces.insert(
            id,
            SurfaceEntry {
                surface: ProgressSurface::new(id, kind, title, orders[0].group),
                throttler: ProgressThrottler::default(),
            },
        );

        let dispatched = ServiceEvent::Dispatched {
            id,
            kind,
            order_ids: orders.iter().map(|o| o.id.clone()).collect(),
            destinations: orders.iter().map(|o| o.destination()).collect(),
            group: orders[0].group,
        };

        let worker = Arc::new(Worker::new(id, orders, variant));
        self.workers.write().insert(id, Arc::clone(&worker));
        self.keep_alive.acquire();
        self.events.publish(dispatched);

        let reporter = Arc::new(LoaderReporter::new(id, self.tx.clone()));
        // 句柄不保留：异常在 Worker 内部转换为 Delivery
        let _ = worker.start(reporter);
        info!("{} 已派发: kind={:?}", id, kind);
        id
    }

    async fn handle_message(&self, msg: LoaderMessage) {
        let LoaderMessage { id, event } = msg;
        match event {
            LoaderEvent::Finished(deliveries) => self.on_finished(id, deliveries).await,
            other => self.on_progress_event(id, other),
        }
    }

    fn on_progress_event(&self, id: LoaderId, event: LoaderEvent) {
        let publish = {
            let Some(mut entry) = self.surfaces.get_mut(&id) else {
                return;
            };
            let SurfaceEntry { surface, throttler } = &mut *entry;
            match event {
                LoaderEvent::Buffering(percent) => {
                    surface.status_text = Some(format!("buffering {}%", percent));
                    Some(ServiceEvent::Buffering { id, percent })
                }
                LoaderEvent::ContentLength(bytes) => {
                    surface.content_length = Some(bytes);
                    Some(ServiceEvent::ContentLength { id, bytes })
                }
                LoaderEvent::Progress { fraction, eta_secs } => {
                    surface.fraction = Some(fraction);
                    surface.eta_secs = eta_secs;
                    throttler
                        .should_emit_fraction(fraction)
                        .then_some(ServiceEvent::Progress { id, fraction, eta_secs })
                }
                LoaderEvent::AbsoluteProgress {
                    elapsed_ms,
                    total_ms,
                    eta_secs,
                } => {
                    surface.elapsed_ms = Some(elapsed_ms);
                    surface.total_ms = total_ms;
                    surface.eta_secs = eta_secs;
                    throttler.should_emit().then_some(ServiceEvent::AbsoluteProgress {
                        id,
                        elapsed_ms,
                        total_ms,
                        eta_secs,
                    })
                }
                LoaderEvent::NoProgressAvailable => {
                    surface.indeterminate = true;
                    Some(ServiceEvent::NoProgressAvailable { id })
                }
                LoaderEvent::LiveStreamDetected => {
                    surface.indeterminate = true;
                    surface.stop_offered = true;
                    Some(ServiceEvent::LiveStreamDetected { id })
                }
                LoaderEvent::ResourceNameResolved(name) => {
                    surface.title = name.clone();
                    Some(ServiceEvent::ResourceNameResolved { id, name })
                }
                LoaderEvent::StatusMessage { text, is_error } => {
                    surface.status_text = Some(text.clone());
                    surface.is_error = is_error;
                    Some(ServiceEvent::StatusMessage { id, text, is_error })
                }
                LoaderEvent::Finished(_) => None,
            }
        };

        if let Some(event) = publish {
            self.events.publish(event);
        }
    }

    async fn on_finished(&self, id: LoaderId, deliveries: Vec<Delivery>) {
        let removed = self.workers.write().remove(&id);
        self.surfaces.remove(&id);
        if removed.is_some() {
            self.keep_alive.release();
        }

        for delivery in deliveries {
            self.process_delivery(id, delivery).await;
        }

        if self.active_count() == 0 && !self.shutdown.is_cancelled() {
            self.queue.next_please(self, false).await;
        }
        if self.active_count() == 0 {
            self.events.publish(ServiceEvent::Idle);
        }
    }

    async fn process_delivery(&self, id: LoaderId, delivery: Delivery) {
        let destination = delivery.order.destination();
        let owner = delivery.order.id.clone();

        let delivery = if delivery.is_success() {
            self.complete_extension(delivery).await
        } else {
            delivery
        };

        let ctx = RecoveryContext {
            partial_exists: !delivery.is_success() && tokio::fs::metadata(&destination).await.is_ok(),
            queued_for_host: match delivery.order.host() {
                Some(host) => self.queue.all_for_host(&host).await.len(),
                None => 0,
            },
        };
        let classification = recovery::classify(&delivery, &ctx);
        info!(
            "{} 结果: {} -> {:?} ({})",
            id, delivery.order.source, classification.outcome, delivery.code
        );

        match classification.outcome {
            Outcome::Cancelled => {
                if ctx.partial_exists {
                    if let Err(e) = tokio::fs::remove_file(&destination).await {
                        warn!("清理已取消的部分文件失败: {:?}, {}", destination, e);
                    }
                }
            }
            Outcome::Deferred => {
                // 重新开始时从头下载，保留原文件名
                if ctx.partial_exists {
                    let _ = tokio::fs::remove_file(&destination).await;
                }
                let mut wish = delivery.order.retry_wish();
                if wish.filename.is_none() {
                    wish.filename = Some(delivery.order.filename.clone());
                }
                self.queue.add(vec![wish.held(true)]).await;
            }
            Outcome::HeldOn => {
                // 暂停期间保留路径占用，转交给续传副本
                let resumed = delivery.order.resumed();
                if !self.claim(&destination, &resumed.id, Some(owner.as_str())) {
                    warn!("暂停的目标路径已被占用: {:?}", destination);
                }
                self.held_orders.lock().push(resumed);
            }
            Outcome::Success | Outcome::Failed => {}
        }
        if classification.outcome != Outcome::HeldOn {
            self.release(&destination, &owner);
        }

        let outcome = classification.outcome;
        let group = delivery.order.group;
        self.events.publish(ServiceEvent::Finished {
            id,
            code: delivery.code,
            file: delivery.file.clone(),
            order: delivery.order,
            classification,
        });

        if let Some(group) = group {
            self.count_group(group, outcome);
        }
    }

    /// 媒体类型暗示了扩展名而文件没有时，重命名文件
    async fn complete_extension(&self, mut delivery: Delivery) -> Delivery {
        let Some(file) = delivery.file.clone() else {
            return delivery;
        };
        let name = delivery.order.filename.clone();
        if naming::has_extension(&name) {
            return delivery;
        }
        let with_ext = naming::ensure_extension(&name, delivery.media_type.as_deref());
        if with_ext == name {
            return delivery;
        }

        let owner = delivery.order.id.clone();
        let target = match self.reserve(&delivery.order.folder.join(&with_ext), &owner) {
            Ok(target) => target,
            Err(e) => {
                warn!("补全扩展名失败: {:#}", e);
                return delivery;
            }
        };
        let renamed = tokio::fs::rename(&file, &target).await;
        self.release(&target, &owner);

        match renamed {
            Ok(()) => {
                debug!("补全扩展名: {:?} -> {:?}", file, target);
                if let Some(new_name) = target.file_name() {
                    delivery.order.filename = new_name.to_string_lossy().into_owned();
                }
                delivery.file = Some(target);
            }
            Err(e) => warn!("重命名失败: {:?} -> {:?}, {}", file, target, e),
        }
        delivery
    }

    fn count_group(&self, group: GroupId, outcome: Outcome) {
        let summary = {
            let mut groups = self.groups.lock();
            let Some(tally) = groups.get_mut(&group) else {
                return;
            };
            tally.finished += 1;
            match outcome {
                Outcome::Success => tally.succeeded += 1,
                Outcome::Failed => tally.failed += 1,
                _ => {}
            }
            if tally.finished < tally.total {
                return;
            }
            groups.remove(&group)
        };

        if let Some(tally) = summary {
            info!(
                "{} 全部结束: 成功 {} / 失败 {} / 共 {}",
                group, tally.succeeded, tally.failed, tally.total
            );
            self.events.publish(ServiceEvent::GroupSummary {
                group,
                total: tally.total,
                succeeded: tally.succeeded,
                failed: tally.failed,
                compact_counter: (tally.total <= COMPACT_GROUP_LIMIT).then_some(tally.total as u32),
            });
        }
    }
}

#[async_trait]
impl WishDispatcher for Inner {
    async fn active_count(&self) -> usize {
        Inner::active_count(self)
    }

    async fn dispatch(&self, wish: Wish) -> Result<()> {
        match self.submit(wish.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.events.publish(ServiceEvent::DispatchFailed {
                    wish,
                    reason: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorCode, ResultCode};
    use std::sync::atomic::AtomicUsize;

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.download.download_dir = dir.to_path_buf();
        config.download.min_free_space_mb = 0;
        config
    }

    struct Counting(AtomicUsize);

    impl WakeLock for Counting {
        fn acquire(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn next_dispatched(rx: &mut mpsc::UnboundedReceiver<ServiceEvent>) -> (Vec<String>, Vec<PathBuf>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(ServiceEvent::Dispatched {
                    order_ids,
                    destinations,
                    ..
                })) => return (order_ids, destinations),
                Ok(Some(_)) => continue,
                other => panic!("no dispatched event: {:?}", other.is_ok()),
            }
        }
    }

    async fn next_finished(
        rx: &mut mpsc::UnboundedReceiver<ServiceEvent>,
    ) -> (Order, ResultCode, recovery::Classification) {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(ServiceEvent::Finished {
                    order,
                    code,
                    classification,
                    ..
                })) => return (order, code, classification),
                Ok(Some(_)) => continue,
                other => panic!("no finished event: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let err = service.submit(Wish::new("gopher://host/a")).await.unwrap_err();
        assert!(err.to_string().contains("gopher"));
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_local_copy_and_collision_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a.bin");
        tokio::fs::write(&src, vec![7u8; 1000]).await.unwrap();

        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();

        service.submit(Wish::new(src.to_string_lossy())).await.unwrap();
        let (order, code, classification) = next_finished(&mut rx).await;
        assert_eq!(code, ResultCode::Success);
        assert_eq!(classification.outcome, Outcome::Success);
        assert_eq!(order.filename, "a.bin");

        service.submit(Wish::new(src.to_string_lossy())).await.unwrap();
        let (order, _, _) = next_finished(&mut rx).await;
        assert_eq!(order.filename, "a(1).bin");
        assert_eq!(
            tokio::fs::metadata(dir.path().join("a(1).bin")).await.unwrap().len(),
            1000
        );
    }

    #[tokio::test]
    async fn test_in_flight_reservations_prevent_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let first = service.inner.resolve(&Wish::new("https://h/x.bin"), None).await.unwrap();
        let second = service.inner.resolve(&Wish::new("https://h/x.bin"), None).await.unwrap();
        assert_eq!(first.filename, "x.bin");
        assert_eq!(second.filename, "x(1).bin");
        assert_ne!(first.destination(), second.destination());
    }

    #[tokio::test]
    async fn test_group_summary_emitted_once() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let mut wishes = Vec::new();
        for i in 0..3 {
            let src = src_dir.path().join(format!("{}.txt", i));
            tokio::fs::write(&src, format!("file {}", i)).await.unwrap();
            wishes.push(Wish::new(src.to_string_lossy()));
        }
        wishes.push(Wish::new(src_dir.path().join("missing.txt").to_string_lossy()));

        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();
        let (group, ids) = service.submit_group(wishes).await.unwrap();
        assert_eq!(ids.len(), 1, "local copies share one loader");

        let mut summaries = Vec::new();
        let mut finished = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap() {
                Some(ServiceEvent::Finished { order, .. }) => {
                    assert_eq!(order.group, Some(group));
                    finished += 1;
                }
                Some(ServiceEvent::GroupSummary {
                    group: g,
                    total,
                    succeeded,
                    failed,
                    compact_counter,
                }) => summaries.push((g, total, succeeded, failed, compact_counter)),
                Some(ServiceEvent::Idle) => break,
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
        assert_eq!(finished, 4);
        assert_eq!(summaries, vec![(group, 4, 3, 1, Some(4))]);
    }

    #[tokio::test]
    async fn test_stop_requests_after_finish_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();

        let id = service.submit(Wish::new("/definitely/missing/file.bin")).await.unwrap();
        let (_, code, _) = next_finished(&mut rx).await;
        assert_eq!(code, ResultCode::Error(ErrorCode::NoSourceFound));

        assert!(!service.cancel(id));
        assert!(!service.hold_on(id));
        assert!(!service.defer(id));
        assert!(!service.is_active(id));
    }

    #[tokio::test]
    async fn test_keep_alive_released_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(Counting(AtomicUsize::new(0)));
        let service = LoaderService::builder(config(dir.path()))
            .wake_lock(lock.clone())
            .build()
            .unwrap();
        let (_sub, mut rx) = service.subscribe();

        service.submit(Wish::new("/definitely/missing/file.bin")).await.unwrap();
        loop {
            if let Some(ServiceEvent::Idle) = rx.recv().await {
                break;
            }
        }
        assert_eq!(lock.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_partial_respects_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let order = service.inner.resolve(&Wish::new("https://h/p.bin"), None).await.unwrap();
        tokio::fs::write(order.destination(), b"partial").await.unwrap();

        assert!(!service.delete_partial(&order).await.unwrap());
        service.inner.release(&order.destination(), &order.id);
        assert!(service.delete_partial(&order).await.unwrap());
        assert!(!service.delete_partial(&order).await.unwrap());
    }

    #[tokio::test]
    async fn test_held_order_keeps_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();

        let order = service.inner.resolve(&Wish::new("https://h/a.bin"), None).await.unwrap();
        tokio::fs::write(order.destination(), b"half").await.unwrap();
        service
            .inner
            .process_delivery(LoaderId(1), Delivery::failure(order.clone(), LoaderError::HeldOn))
            .await;
        let (_, _, classification) = next_finished(&mut rx).await;
        assert_eq!(classification.outcome, Outcome::HeldOn);

        // 暂停期间同名的新下载必须换名
        let fresh = service.inner.resolve(&Wish::new("https://h/a.bin"), None).await.unwrap();
        assert_eq!(fresh.filename, "a(1).bin");
        assert!(!service.delete_partial(&order).await.unwrap());

        let held = service.held_orders();
        assert_eq!(held.len(), 1);
        service.network_restored().await;
        let (order_ids, destinations) = next_dispatched(&mut rx).await;
        assert_eq!(order_ids, vec![held[0].id.clone()]);
        assert_eq!(destinations, vec![order.destination()]);
    }

    #[tokio::test]
    async fn test_resume_onto_taken_path_gets_new_name() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();

        let held = service.inner.resolve(&Wish::new("https://h/a.bin"), None).await.unwrap();
        service.inner.release(&held.destination(), &held.id);
        let fresh = service.inner.resolve(&Wish::new("https://h/a.bin"), None).await.unwrap();
        assert_eq!(fresh.destination(), held.destination());

        service.inner.held_orders.lock().push(held.resumed());
        assert_eq!(service.network_restored().await.len(), 1);
        let (_, destinations) = next_dispatched(&mut rx).await;
        assert_eq!(destinations.len(), 1);
        assert_ne!(destinations[0], fresh.destination());
        assert_eq!(
            service.inner.reservations.lock().get(&fresh.destination()),
            Some(&fresh.id)
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_cancelled_loaders() {
        // 只接受连接、从不响应的服务器
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(Counting(AtomicUsize::new(0)));
        let service = LoaderService::builder(config(dir.path()))
            .wake_lock(lock.clone())
            .build()
            .unwrap();
        let (_sub, mut rx) = service.subscribe();

        let uri = format!("http://{}/slow.bin", addr);
        service.submit(Wish::new(uri.clone())).await.unwrap();
        assert_eq!(lock.0.load(Ordering::SeqCst), 1);

        service.shutdown();
        let (_, code, classification) = next_finished(&mut rx).await;
        assert_eq!(code, ResultCode::Error(ErrorCode::Cancelled));
        assert_eq!(classification.outcome, Outcome::Cancelled);
        assert_eq!(lock.0.load(Ordering::SeqCst), 0);
        assert!(service.inner.reservations.lock().is_empty());
        assert_eq!(service.active_count(), 0);

        assert!(service.submit(Wish::new(uri)).await.is_err());
    }

    #[tokio::test]
    async fn test_queued_wish_that_cannot_dispatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("q.txt");
        tokio::fs::write(&src, b"queued").await.unwrap();

        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();
        service
            .queue()
            .add(vec![Wish::new("gopher://h/a"), Wish::new(src.to_string_lossy())])
            .await;

        assert!(service.next_please(false).await);
        assert!(service.queue().is_empty().await);

        let mut failed = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap() {
                Some(ServiceEvent::DispatchFailed { wish, reason }) => {
                    assert!(reason.contains("gopher"));
                    failed.push(wish.uri);
                }
                Some(ServiceEvent::Finished { order, code, .. }) => {
                    assert_eq!(code, ResultCode::Success);
                    assert_eq!(order.filename, "q.txt");
                    break;
                }
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
        assert_eq!(failed, vec!["gopher://h/a"]);
    }

    #[tokio::test]
    async fn test_size_hint_reaches_order() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoaderService::new(config(dir.path())).unwrap();
        let (_sub, mut rx) = service.subscribe();

        let order = service
            .inner
            .resolve(&Wish::new("https://h/s.bin").with_size(4096), None)
            .await
            .unwrap();
        assert_eq!(order.expected_size, Some(4096));
        assert_eq!(order.retry_wish().size, Some(4096));

        // 磁盘信息可用时，超出容量的下载在连接前就失败
        if crate::loader::storage::available_space(dir.path()).is_none() {
            return;
        }
        service
            .submit(Wish::new("http://127.0.0.1:9/huge.bin").with_size(u64::MAX / 2))
            .await
            .unwrap();
        let (order, code, _) = next_finished(&mut rx).await;
        assert_eq!(order.expected_size, Some(u64::MAX / 2));
        assert_eq!(code, ResultCode::Error(ErrorCode::InsufficientStorage));
    }
}

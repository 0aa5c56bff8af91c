use crate::model::Wish;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 队列出口：由协调器实现
#[async_trait]
pub trait WishDispatcher: Send + Sync {
    /// 正在运行的 Loader 数量
    async fn active_count(&self) -> usize;

    /// 立即派发一个 Wish
    async fn dispatch(&self, wish: Wish) -> anyhow::Result<()>;
}

/// 队列条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub wish: Wish,
    /// 入队序号
    pub seq: u64,
    /// 入队时间 (Unix timestamp)
    pub enqueued_at: i64,
}

/// 等待队列
///
/// 先进先出，按 `uri + filename` 去重。
/// held 的 Wish 只有在强制派发时才会被取出。
#[derive(Debug, Default)]
pub struct QueueManager {
    entries: RwLock<VecDeque<QueueEntry>>,
    next_seq: AtomicU64,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加 Wish，返回实际加入的数量
    pub async fn add(&self, wishes: Vec<Wish>) -> usize {
        let mut entries = self.entries.write().await;
        let mut known: HashSet<Wish> = entries.iter().map(|e| e.wish.clone()).collect();
        let now = chrono::Utc::now().timestamp();

        let mut added = 0;
        for wish in wishes {
            if !known.insert(wish.clone()) {
                debug!("忽略重复的排队请求: {}", wish.uri);
                continue;
            }
            entries.push_back(QueueEntry {
                wish,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                enqueued_at: now,
            });
            added += 1;
        }

        if added > 0 {
            info!("加入等待队列: {} 个，当前队列长度: {}", added, entries.len());
        }
        added
    }

    /// 移除指定 Wish，返回移除的数量
    pub async fn remove(&self, wishes: &[Wish]) -> usize {
        let targets: HashSet<&Wish> = wishes.iter().collect();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| !targets.contains(&e.wish));
        before - entries.len()
    }

    /// 同一主机上排队的 Wish
    pub async fn all_for_host(&self, host: &str) -> Vec<Wish> {
        let host = host.to_ascii_lowercase();
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.wish.host().as_deref() == Some(host.as_str()))
            .map(|e| e.wish.clone())
            .collect()
    }

    /// 移除同一主机上排队的所有 Wish
    pub async fn remove_for_host(&self, host: &str) -> usize {
        let host = host.to_ascii_lowercase();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.wish.host().as_deref() != Some(host.as_str()));
        let removed = before - entries.len();
        if removed > 0 {
            info!("已移除主机 {} 的 {} 个排队下载", host, removed);
        }
        removed
    }

    /// 取出最早的非 held Wish
    pub async fn pop_next(&self) -> Option<Wish> {
        let mut entries = self.entries.write().await;
        let index = entries.iter().position(|e| !e.wish.held)?;
        entries.remove(index).map(|e| e.wish)
    }

    /// 取出最早的 Wish（包括 held），并清除 held 标记
    async fn pop_front_any(&self) -> Option<Wish> {
        let mut wish = self.entries.write().await.pop_front()?.wish;
        wish.held = false;
        Some(wish)
    }

    /// 没有 Loader 在运行（或强制）时派发一个 Wish
    ///
    /// 派发失败的 Wish 被丢弃，继续尝试下一个，直到成功或队列取空。
    /// 返回是否派发了
    pub async fn next_please(&self, dispatcher: &dyn WishDispatcher, force: bool) -> bool {
        if !force && dispatcher.active_count().await > 0 {
            return false;
        }

        loop {
            let next = if force {
                self.pop_front_any().await
            } else {
                self.pop_next().await
            };
            let Some(wish) = next else {
                return false;
            };

            let uri = wish.uri.clone();
            match dispatcher.dispatch(wish).await {
                Ok(()) => {
                    debug!("从队列派发: {}", uri);
                    return true;
                }
                Err(e) => warn!("队列派发失败，已丢弃: {}, 错误: {:#}", uri, e),
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, wish: &Wish) -> bool {
        self.entries.read().await.iter().any(|e| &e.wish == wish)
    }

    /// 队列快照（供外部持久化）
    pub async fn snapshot(&self) -> Vec<Wish> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.wish.clone())
            .collect()
    }

    /// 用快照替换当前队列，返回恢复的数量
    pub async fn restore(&self, wishes: Vec<Wish>) -> usize {
        self.entries.write().await.clear();
        self.add(wishes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeDispatcher {
        active: AtomicUsize,
        dispatched: Mutex<Vec<Wish>>,
    }

    #[async_trait]
    impl WishDispatcher for FakeDispatcher {
        async fn active_count(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        async fn dispatch(&self, wish: Wish) -> anyhow::Result<()> {
            if wish.uri.starts_with("gopher:") {
                anyhow::bail!("不支持的协议: {}", wish.uri);
            }
            self.dispatched.lock().push(wish);
            Ok(())
        }
    }

    fn wish(uri: &str) -> Wish {
        Wish::new(uri)
    }

    #[tokio::test]
    async fn test_add_dedupes() {
        let queue = QueueManager::new();
        assert_eq!(queue.add(vec![wish("https://a/1"), wish("https://a/1")]).await, 1);
        assert_eq!(queue.add(vec![wish("https://a/1").with_title("again")]).await, 0);
        assert_eq!(queue.add(vec![wish("https://a/1").with_filename("x")]).await, 1);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_host_operations() {
        let queue = QueueManager::new();
        queue
            .add(vec![
                wish("https://a.example/1"),
                wish("https://B.example/2"),
                wish("https://a.example/3"),
            ])
            .await;

        assert_eq!(queue.all_for_host("A.EXAMPLE").await.len(), 2);
        assert_eq!(queue.remove_for_host("a.example").await, 2);
        assert_eq!(queue.snapshot().await, vec![wish("https://b.example/2")]);
        assert_eq!(queue.remove(&[wish("https://B.example/2")]).await, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_next_please_waits_for_idle() {
        let queue = QueueManager::new();
        let dispatcher = FakeDispatcher::default();
        queue.add(vec![wish("https://a/1"), wish("https://a/2")]).await;

        dispatcher.active.store(1, Ordering::SeqCst);
        assert!(!queue.next_please(&dispatcher, false).await);
        assert_eq!(queue.len().await, 2);

        assert!(queue.next_please(&dispatcher, true).await);
        dispatcher.active.store(0, Ordering::SeqCst);
        assert!(queue.next_please(&dispatcher, false).await);
        assert!(!queue.next_please(&dispatcher, false).await);

        let uris: Vec<String> = dispatcher.dispatched.lock().iter().map(|w| w.uri.clone()).collect();
        assert_eq!(uris, vec!["https://a/1", "https://a/2"]);
    }

    #[tokio::test]
    async fn test_held_wishes_need_force() {
        let queue = QueueManager::new();
        let dispatcher = FakeDispatcher::default();
        queue
            .add(vec![wish("https://a/held").held(true), wish("https://a/free")])
            .await;

        assert!(queue.next_please(&dispatcher, false).await);
        assert!(!queue.next_please(&dispatcher, false).await);
        assert_eq!(queue.len().await, 1);

        assert!(queue.next_please(&dispatcher, true).await);
        let dispatched = dispatcher.dispatched.lock();
        assert_eq!(dispatched[0].uri, "https://a/free");
        assert_eq!(dispatched[1].uri, "https://a/held");
        assert!(!dispatched[1].held);
    }

    #[tokio::test]
    async fn test_failed_dispatch_moves_on() {
        let queue = QueueManager::new();
        let dispatcher = FakeDispatcher::default();
        queue
            .add(vec![wish("gopher://old/1"), wish("gopher://old/2"), wish("https://a/ok")])
            .await;

        assert!(queue.next_please(&dispatcher, false).await);
        assert!(queue.is_empty().await);
        let uris: Vec<String> = dispatcher.dispatched.lock().iter().map(|w| w.uri.clone()).collect();
        assert_eq!(uris, vec!["https://a/ok"]);

        queue.add(vec![wish("gopher://old/3")]).await;
        assert!(!queue.next_please(&dispatcher, false).await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_replaces() {
        let queue = QueueManager::new();
        queue.add(vec![wish("https://a/1")]).await;
        let restored = queue
            .restore(vec![wish("https://b/1"), wish("https://b/2"), wish("https://b/1")])
            .await;
        assert_eq!(restored, 2);
        assert_eq!(queue.snapshot().await, vec![wish("https://b/1"), wish("https://b/2")]);
    }

    proptest! {
        #[test]
        fn prop_fifo_order(ids in proptest::collection::vec(0u16..50, 0..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let queue = QueueManager::new();
                for id in &ids {
                    queue.add(vec![wish(&format!("https://h/{}", id))]).await;
                }

                let mut expected = Vec::new();
                for id in &ids {
                    let uri = format!("https://h/{}", id);
                    if !expected.contains(&uri) {
                        expected.push(uri);
                    }
                }

                let mut popped = Vec::new();
                while let Some(w) = queue.pop_next().await {
                    popped.push(w.uri);
                }
                assert_eq!(popped, expected);
            });
        }
    }
}

//! 保持唤醒
//!
//! 只要还有 Loader 在运行就持有唤醒锁，最后一个结束时释放

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// 平台唤醒锁
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// 不做任何事
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// 引用计数的唤醒锁
pub struct KeepAlive {
    holders: Mutex<usize>,
    lock: Arc<dyn WakeLock>,
}

impl KeepAlive {
    pub fn new(lock: Arc<dyn WakeLock>) -> Self {
        Self {
            holders: Mutex::new(0),
            lock,
        }
    }

    pub fn acquire(&self) {
        let mut holders = self.holders.lock();
        *holders += 1;
        if *holders == 1 {
            debug!("获取唤醒锁");
            self.lock.acquire();
        }
    }

    /// 多余的释放被忽略
    pub fn release(&self) {
        let mut holders = self.holders.lock();
        if *holders == 0 {
            return;
        }
        *holders -= 1;
        if *holders == 0 {
            debug!("释放唤醒锁");
            self.lock.release();
        }
    }

    pub fn holders(&self) -> usize {
        *self.holders.lock()
    }
}

//! Loader 标识分配

use crate::loader::LoaderId;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

/// 默认标识范围，与外部通知ID错开
pub const DEFAULT_ID_RANGE: Range<u32> = 4096..65536;

/// 原子计数器，用尽后回绕到范围起点
#[derive(Debug)]
pub struct LoaderIdAllocator {
    range: Range<u32>,
    next: AtomicU32,
}

impl LoaderIdAllocator {
    /// 空范围退回默认范围
    pub fn new(range: Range<u32>) -> Self {
        let range = if range.is_empty() { DEFAULT_ID_RANGE } else { range };
        Self {
            next: AtomicU32::new(range.start),
            range,
        }
    }

    pub fn allocate(&self) -> LoaderId {
        let start = self.range.start;
        let end = self.range.end;
        let value = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current + 1;
                Some(if next >= end { start } else { next })
            })
            .unwrap_or(start);
        LoaderId(value)
    }
}

impl Default for LoaderIdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_RANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_in_range() {
        let alloc = LoaderIdAllocator::default();
        assert_eq!(alloc.allocate(), LoaderId(4096));
        assert_eq!(alloc.allocate(), LoaderId(4097));
    }

    #[test]
    fn test_wraps_to_start() {
        let alloc = LoaderIdAllocator::new(10..13);
        let ids: Vec<u32> = (0..5).map(|_| alloc.allocate().0).collect();
        assert_eq!(ids, vec![10, 11, 12, 10, 11]);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = Arc::new(LoaderIdAllocator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || (0..1000).map(|_| alloc.allocate().0).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(DEFAULT_ID_RANGE.contains(&id));
                assert!(seen.insert(id));
            }
        }
    }
}

// Loader Service Library
// 多协议下载服务核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 数据模型（Wish / Order / Delivery）
pub mod model;

// 各协议的 Loader 实现
pub mod loader;

// 等待队列
pub mod queue;

// 下载协调器
pub mod service;

// 导出常用类型
pub use config::AppConfig;
pub use loader::{LoaderError, LoaderId, StopReason};
pub use model::{Delivery, ErrorCode, GroupId, LoaderKind, Order, ResultCode, Wish};
pub use queue::QueueManager;
pub use service::{LoaderService, Outcome, RecoveryAction, ServiceEvent};

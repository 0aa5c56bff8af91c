//! 下载服务：协调器及其协作组件

pub mod contracts;
pub mod coordinator;
pub mod events;
pub mod identity;
pub mod keep_alive;
pub mod naming;
pub mod recovery;
pub mod throttle;

pub use contracts::{
    AllowAllHosts, AuthManager, ConfigHostPolicy, Credentials, FixedProxy, HostPolicy,
    MemoryAuthManager, ProxySelector,
};
pub use coordinator::{LoaderService, LoaderServiceBuilder};
pub use events::{EventHub, ProgressSurface, ServiceEvent, SubscriptionId};
pub use identity::LoaderIdAllocator;
pub use keep_alive::{KeepAlive, NoopWakeLock, WakeLock};
pub use naming::{CollisionResolver, SuffixResolver};
pub use recovery::{classify, Classification, Outcome, RecoveryAction, RecoveryContext};
pub use throttle::ProgressThrottler;

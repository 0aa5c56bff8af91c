//! 外部协作方接口
//!
//! 主机策略、代理选择、凭证保管、唤醒锁都由外部实现，
//! 协调器只通过这里的 trait 使用它们

use crate::config::NetworkConfig;
use parking_lot::RwLock;
use reqwest::Url;
use std::collections::HashMap;
use std::fmt;

pub use crate::loader::session::{RemoteSession, SessionConnector, SessionProtocol};
pub use crate::service::keep_alive::WakeLock;
pub use crate::service::naming::{CollisionResolver, SuffixResolver};

/// 主机可接受性检查
pub trait HostPolicy: Send + Sync {
    /// 主机是否被屏蔽
    fn is_blocked(&self, host: &str) -> bool;

    /// 是否允许对该主机使用明文 HTTP
    fn permits_cleartext(&self, host: &str) -> bool;
}

/// 全部放行
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllHosts;

impl HostPolicy for AllowAllHosts {
    fn is_blocked(&self, _host: &str) -> bool {
        false
    }

    fn permits_cleartext(&self, _host: &str) -> bool {
        true
    }
}

/// 基于配置的主机策略（后缀匹配）
#[derive(Debug, Clone, Default)]
pub struct ConfigHostPolicy {
    blocked: Vec<String>,
    cleartext_denied: Vec<String>,
}

impl ConfigHostPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        let normalize = |hosts: &[String]| {
            hosts
                .iter()
                .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect()
        };
        Self {
            blocked: normalize(&config.blocked_hosts),
            cleartext_denied: normalize(&config.cleartext_denied_hosts),
        }
    }

    fn matches(list: &[String], host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        list.iter().any(|pattern| {
            pattern == "*"
                || host == *pattern
                || host
                    .strip_suffix(pattern.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl HostPolicy for ConfigHostPolicy {
    fn is_blocked(&self, host: &str) -> bool {
        Self::matches(&self.blocked, host)
    }

    fn permits_cleartext(&self, host: &str) -> bool {
        !Self::matches(&self.cleartext_denied, host)
    }
}

/// 代理选择
pub trait ProxySelector: Send + Sync {
    /// 返回代理地址，None 表示直连
    fn proxy_for(&self, url: &Url) -> Option<String>;
}

/// 固定代理
#[derive(Debug, Clone)]
pub struct FixedProxy(pub String);

impl ProxySelector for FixedProxy {
    fn proxy_for(&self, _url: &Url) -> Option<String> {
        Some(self.0.clone())
    }
}

/// 一组凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub scheme: String,
    pub userid: String,
    pub password: String,
}

impl Credentials {
    pub fn new(scheme: impl Into<String>, userid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            userid: userid.into(),
            password: password.into(),
        }
    }
}

// 密码不进日志
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("scheme", &self.scheme)
            .field("userid", &self.userid)
            .field("password", &"***")
            .finish()
    }
}

/// 凭证保管（按 realm）
pub trait AuthManager: Send + Sync {
    fn credentials(&self, realm: &str) -> Option<Credentials>;

    fn store(&self, realm: &str, credentials: Credentials);

    fn forget(&self, realm: &str);
}

/// 进程内凭证保管
#[derive(Debug, Default)]
pub struct MemoryAuthManager {
    entries: RwLock<HashMap<String, Credentials>>,
}

impl MemoryAuthManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthManager for MemoryAuthManager {
    fn credentials(&self, realm: &str) -> Option<Credentials> {
        self.entries.read().get(realm).cloned()
    }

    fn store(&self, realm: &str, credentials: Credentials) {
        self.entries.write().insert(realm.to_string(), credentials);
    }

    fn forget(&self, realm: &str) {
        self.entries.write().remove(realm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_host_policy() {
        let config = NetworkConfig {
            blocked_hosts: vec!["ads.example".to_string(), ".Tracker.net".to_string()],
            cleartext_denied_hosts: vec!["bank.example".to_string()],
            ..NetworkConfig::default()
        };
        let policy = ConfigHostPolicy::from_config(&config);

        assert!(policy.is_blocked("ads.example"));
        assert!(policy.is_blocked("cdn.ads.example"));
        assert!(!policy.is_blocked("badads.example"));
        assert!(policy.is_blocked("x.tracker.net"));
        assert!(!policy.is_blocked("example.org"));

        assert!(!policy.permits_cleartext("bank.example"));
        assert!(policy.permits_cleartext("news.example"));
    }

    #[test]
    fn test_wildcard_cleartext_denial() {
        let config = NetworkConfig {
            cleartext_denied_hosts: vec!["*".to_string()],
            ..NetworkConfig::default()
        };
        let policy = ConfigHostPolicy::from_config(&config);
        assert!(!policy.permits_cleartext("anything.example"));
    }

    #[test]
    fn test_memory_auth_manager() {
        let auth = MemoryAuthManager::new();
        assert!(auth.credentials("R1").is_none());

        auth.store("R1", Credentials::new("Basic", "bob", "secret"));
        let creds = auth.credentials("R1").unwrap();
        assert_eq!(creds.userid, "bob");
        assert!(!format!("{:?}", creds).contains("secret"));

        auth.forget("R1");
        assert!(auth.credentials("R1").is_none());
    }
}

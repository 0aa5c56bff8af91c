//! Loader 错误类型
//!
//! 每个错误恰好映射到一个 `ResultCode`，协调器据此分类并给出后续操作

use crate::model::{AuthChallenge, ErrorCode, ResultCode};
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("已取消")]
    Cancelled,

    #[error("已推迟，稍后重新排队")]
    Deferred,

    #[error("已暂停，等待网络恢复")]
    HeldOn,

    #[error("无法连接到 {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("源不存在: {source_uri}")]
    NoSourceFound { source_uri: String },

    #[error("传输中断: {reason}")]
    Interrupted { reason: String },

    #[error("存储空间不足: 需要 {needed} bytes, 可用 {available} bytes")]
    InsufficientStorage { needed: u64, available: u64 },

    #[error("主机已被屏蔽: {host}")]
    BlockedHost { host: String },

    #[error("TLS 握手失败 ({host}): {reason}")]
    SslHandshake { host: String, reason: String },

    #[error("无法验证服务器证书 ({host}): {reason}")]
    SslPeerUnverified { host: String, reason: String },

    #[error("不允许对 {host} 使用明文传输")]
    CleartextNotPermitted { host: String },

    #[error("转码失败: {reason}")]
    TranscodeFailed { reason: String },

    #[error("不支持的地址类型: {uri}")]
    UnsupportedScheme { uri: String },

    #[error("无效的地址: {uri}")]
    InvalidLocator { uri: String },

    #[error("协议不可用: {protocol}")]
    ProtocolUnavailable { protocol: String },

    #[error("会话失败: {reason}")]
    Session { reason: String },

    #[error("HTTP {status} ({host})")]
    Http {
        status: u16,
        host: String,
        challenge: Option<AuthChallenge>,
    },

    #[error("重定向次数过多 ({host})")]
    TooManyRedirects { host: String },

    #[error("请求超时 ({host})")]
    Timeout { host: String },

    #[error("IO错误: {0}")]
    Io(#[source] io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl LoaderError {
    /// 对应的结果码
    pub fn code(&self) -> ResultCode {
        let code = match self {
            LoaderError::Http { status, .. } => return ResultCode::Http(*status),
            LoaderError::Cancelled => ErrorCode::Cancelled,
            LoaderError::Deferred => ErrorCode::Deferred,
            LoaderError::HeldOn => ErrorCode::HeldOn,
            LoaderError::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            LoaderError::NoSourceFound { .. } => ErrorCode::NoSourceFound,
            LoaderError::Interrupted { .. } => ErrorCode::Interrupted,
            LoaderError::InsufficientStorage { .. } => ErrorCode::InsufficientStorage,
            LoaderError::BlockedHost { .. } => ErrorCode::BlockedHost,
            LoaderError::SslHandshake { .. } => ErrorCode::SslHandshake,
            LoaderError::SslPeerUnverified { .. } => ErrorCode::SslPeerUnverified,
            LoaderError::CleartextNotPermitted { .. } => ErrorCode::CleartextNotPermitted,
            LoaderError::TranscodeFailed { .. } => ErrorCode::TranscodeFailed,
            LoaderError::UnsupportedScheme { .. } => ErrorCode::UnsupportedScheme,
            LoaderError::InvalidLocator { .. } => ErrorCode::InvalidLocator,
            LoaderError::ProtocolUnavailable { .. } => ErrorCode::ProtocolUnavailable,
            LoaderError::Session { .. } => ErrorCode::SessionFailed,
            LoaderError::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            LoaderError::Timeout { .. } => ErrorCode::Timeout,
            LoaderError::Io(_) => ErrorCode::Io,
            LoaderError::Internal(_) => ErrorCode::Internal,
        };
        ResultCode::Error(code)
    }

    /// 401 时附带的认证质询
    pub fn challenge(&self) -> Option<&AuthChallenge> {
        match self {
            LoaderError::Http { challenge, .. } => challenge.as_ref(),
            _ => None,
        }
    }

    /// 涉及的主机（用于向用户展示）
    pub fn host(&self) -> Option<&str> {
        match self {
            LoaderError::ConnectFailed { host, .. }
            | LoaderError::BlockedHost { host }
            | LoaderError::SslHandshake { host, .. }
            | LoaderError::SslPeerUnverified { host, .. }
            | LoaderError::CleartextNotPermitted { host }
            | LoaderError::Http { host, .. }
            | LoaderError::TooManyRedirects { host }
            | LoaderError::Timeout { host } => Some(host),
            _ => None,
        }
    }

    /// 写入本地文件失败：磁盘满时归为存储不足，其它归为 IO 错误
    pub fn from_write(err: io::Error) -> Self {
        if is_storage_full(&err) {
            LoaderError::InsufficientStorage {
                needed: 0,
                available: 0,
            }
        } else {
            LoaderError::Io(err)
        }
    }

    /// 将 reqwest 错误归类
    ///
    /// TLS 错误在 reqwest 中同样表现为连接错误，只能从错误链的描述中识别
    pub fn from_reqwest(err: reqwest::Error, host: &str) -> Self {
        let host = host.to_string();
        if err.is_redirect() {
            return LoaderError::TooManyRedirects { host };
        }
        if err.is_timeout() {
            return LoaderError::Timeout { host };
        }

        let chain = error_chain_text(&err);
        let lower = chain.to_ascii_lowercase();
        if lower.contains("certificate") || lower.contains("unknownissuer") {
            return LoaderError::SslPeerUnverified {
                host,
                reason: chain,
            };
        }
        if lower.contains("tls") || lower.contains("handshake") || lower.contains("ssl") {
            return LoaderError::SslHandshake {
                host,
                reason: chain,
            };
        }
        if err.is_connect() {
            return LoaderError::ConnectFailed {
                host,
                reason: chain,
            };
        }
        if err.is_body() || err.is_decode() {
            return LoaderError::Interrupted { reason: chain };
        }
        if err.is_builder() {
            return LoaderError::InvalidLocator { uri: chain };
        }
        LoaderError::Internal(chain)
    }
}

/// ENOSPC (Unix) / ERROR_DISK_FULL (Windows)
pub fn is_storage_full(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(28) | Some(112))
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

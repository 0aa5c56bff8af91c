use crate::loader::LoaderError;
use crate::model::Order;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// 私有错误码空间（>= 1000，与 HTTP 状态码区分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ErrorCode {
    Cancelled = 1000,
    Deferred = 1001,
    HeldOn = 1002,
    ConnectFailed = 1003,
    NoSourceFound = 1004,
    Interrupted = 1005,
    InsufficientStorage = 1006,
    BlockedHost = 1007,
    SslHandshake = 1008,
    SslPeerUnverified = 1009,
    CleartextNotPermitted = 1010,
    TranscodeFailed = 1011,
    UnsupportedScheme = 1012,
    InvalidLocator = 1013,
    ProtocolUnavailable = 1014,
    SessionFailed = 1015,
    Io = 1016,
    TooManyRedirects = 1017,
    Timeout = 1018,
    Internal = 1019,
}

/// 结果码：成功 / HTTP 状态码 / 私有错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    Http(u16),
    Error(ErrorCode),
}

impl ResultCode {
    /// 数值形式：成功为 0，HTTP 为状态码，私有错误 >= 1000
    pub fn as_u16(&self) -> u16 {
        match self {
            ResultCode::Success => 0,
            ResultCode::Http(status) => *status,
            ResultCode::Error(code) => *code as u16,
        }
    }

    /// 2xx 和 304 视为成功
    pub fn is_success(&self) -> bool {
        match self {
            ResultCode::Success => true,
            ResultCode::Http(status) => (200..300).contains(status) || *status == 304,
            ResultCode::Error(_) => false,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Success => write!(f, "success"),
            ResultCode::Http(status) => write!(f, "HTTP {}", status),
            ResultCode::Error(code) => write!(f, "{:?}({})", code, *code as u16),
        }
    }
}

/// HTTP 401 认证质询
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub realm: String,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userid: Option<String>,
}

impl AuthChallenge {
    /// 解析 WWW-Authenticate 头，如 `Basic realm="R1", charset="UTF-8"`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = match header.split_once(char::is_whitespace) {
            Some((s, p)) => (s, p),
            None => (header, ""),
        };
        if scheme.is_empty() {
            return None;
        }

        let realm = params
            .split(',')
            .filter_map(|kv| kv.trim().split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("realm"))
            .map(|(_, v)| v.trim().trim_matches('"').to_string())
            .unwrap_or_default();

        Some(Self {
            realm,
            scheme: scheme.to_string(),
            userid: None,
        })
    }

    /// 目前只支持 Basic 认证
    pub fn is_supported(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("basic")
    }
}

/// 一次 Loader 执行的结果
///
/// 每个派发出去的 Order 恰好产生一个 Delivery
#[derive(Debug, Clone)]
pub struct Delivery {
    /// 结果码
    pub code: ResultCode,
    /// 对应的指令
    pub order: Order,
    /// 生成的文件（成功时必有）
    pub file: Option<PathBuf>,
    /// 失败原因
    pub error: Option<Arc<LoaderError>>,
    /// 最终媒体类型（用于补全缺失的扩展名）
    pub media_type: Option<String>,
    /// 401 认证质询
    pub challenge: Option<AuthChallenge>,
    /// 本次写入的字节数
    pub bytes: u64,
}

impl Delivery {
    pub fn success(order: Order, file: PathBuf, bytes: u64) -> Self {
        Self {
            code: ResultCode::Success,
            order,
            file: Some(file),
            error: None,
            media_type: None,
            challenge: None,
            bytes,
        }
    }

    /// 由错误构建失败结果，结果码和认证质询从错误中推导
    pub fn failure(order: Order, error: LoaderError) -> Self {
        let code = error.code();
        let challenge = error.challenge().cloned();
        Self {
            code,
            order,
            file: None,
            error: Some(Arc::new(error)),
            media_type: None,
            challenge,
            bytes: 0,
        }
    }

    pub fn with_media_type(mut self, media_type: Option<String>) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// 错误描述
    pub fn reason(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

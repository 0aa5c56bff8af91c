//! 结果分类与恢复建议
//!
//! 把 Delivery 的结果码映射为用户可见的结局和可执行的后续操作

use crate::model::{Delivery, ErrorCode, ResultCode};
use serde::{Deserialize, Serialize};

/// 结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Cancelled,
    Deferred,
    HeldOn,
    Failed,
}

/// 可执行的后续操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 重新提交
    Retry,
    /// 输入凭证后重试
    RetryWithCredentials { realm: String, scheme: String },
    /// 删除残留的部分文件
    DeletePartialFile,
    /// 放回队列稍后再试
    QueueForLater,
    /// 取消同一主机上排队的下载
    CancelQueuedForHost { host: String, count: usize },
}

/// 分类所需的外部状态
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryContext {
    /// 目标路径上是否残留部分文件
    pub partial_exists: bool,
    /// 队列中同一主机的 Wish 数量
    pub queued_for_host: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RecoveryAction>,
}

impl Classification {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            reason: None,
            actions: Vec::new(),
        }
    }

    fn failed(reason: Option<String>, actions: Vec<RecoveryAction>) -> Self {
        Self {
            outcome: Outcome::Failed,
            reason,
            actions,
        }
    }

    pub fn offers(&self, matches: impl Fn(&RecoveryAction) -> bool) -> bool {
        self.actions.iter().any(matches)
    }
}

/// HTTP 状态码的简短描述
fn status_text(status: u16) -> &'static str {
    match status {
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        429 => "Too Many Requests",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "HTTP error",
    }
}

pub fn classify(delivery: &Delivery, ctx: &RecoveryContext) -> Classification {
    let host = delivery.order.host().unwrap_or_default();
    let file = &delivery.order.filename;

    match delivery.code {
        code if code.is_success() => Classification::new(Outcome::Success),

        ResultCode::Http(401) => {
            let actions = delivery
                .challenge
                .as_ref()
                .filter(|c| c.is_supported())
                .map(|c| {
                    vec![RecoveryAction::RetryWithCredentials {
                        realm: c.realm.clone(),
                        scheme: c.scheme.clone(),
                    }]
                })
                .unwrap_or_default();
            let reason = match &delivery.challenge {
                Some(c) => format!("authentication required for {} (realm \"{}\")", host, c.realm),
                None => format!("authentication required for {}", host),
            };
            Classification::failed(Some(reason), actions)
        }

        ResultCode::Http(status @ (403 | 404 | 410 | 429 | 451 | 503)) => Classification::failed(
            Some(format!("HTTP {} {}: {} ({})", status, status_text(status), host, file)),
            Vec::new(),
        ),

        ResultCode::Http(status) => Classification::failed(
            Some(format!("HTTP {} {}: {}", status, status_text(status), host)),
            vec![RecoveryAction::Retry],
        ),

        ResultCode::Success => Classification::new(Outcome::Success),

        ResultCode::Error(code) => classify_private(code, delivery, ctx, host),
    }
}

fn classify_private(
    code: ErrorCode,
    delivery: &Delivery,
    ctx: &RecoveryContext,
    host: String,
) -> Classification {
    let reason = delivery.reason();
    match code {
        ErrorCode::Cancelled => Classification::new(Outcome::Cancelled),
        ErrorCode::Deferred => Classification::new(Outcome::Deferred),
        ErrorCode::HeldOn => Classification::new(Outcome::HeldOn),

        ErrorCode::ConnectFailed => {
            let mut actions = vec![RecoveryAction::Retry, RecoveryAction::QueueForLater];
            if ctx.queued_for_host > 0 {
                actions.push(RecoveryAction::CancelQueuedForHost {
                    host,
                    count: ctx.queued_for_host,
                });
            }
            Classification::failed(reason, actions)
        }

        ErrorCode::Interrupted => {
            let mut actions = Vec::new();
            if ctx.partial_exists {
                actions.push(RecoveryAction::DeletePartialFile);
            }
            actions.push(RecoveryAction::Retry);
            Classification::failed(reason, actions)
        }

        ErrorCode::InsufficientStorage => Classification::failed(
            reason,
            vec![RecoveryAction::QueueForLater, RecoveryAction::Retry],
        ),

        ErrorCode::NoSourceFound
        | ErrorCode::BlockedHost
        | ErrorCode::SslHandshake
        | ErrorCode::SslPeerUnverified
        | ErrorCode::CleartextNotPermitted
        | ErrorCode::TranscodeFailed
        | ErrorCode::UnsupportedScheme
        | ErrorCode::InvalidLocator
        | ErrorCode::ProtocolUnavailable => Classification::failed(reason, Vec::new()),

        ErrorCode::Io
        | ErrorCode::Timeout
        | ErrorCode::SessionFailed
        | ErrorCode::TooManyRedirects
        | ErrorCode::Internal => Classification::failed(reason, vec![RecoveryAction::Retry]),
    }
}

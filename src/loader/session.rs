//! FTP / SFTP 会话传输
//!
//! 协议本身由外部的 `SessionConnector` 实现，这里只负责
//! 续传偏移、空间预检、取消和进度。

use crate::loader::{
    storage, ByteProgress, LoaderContext, LoaderControl, LoaderError, ProgressSink, Transferred,
};
use crate::model::Order;
use crate::service::contracts::{AuthManager, Credentials, HostPolicy};
use async_trait::async_trait;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const SESSION_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionProtocol {
    Ftp,
    Sftp,
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionProtocol::Ftp => write!(f, "ftp"),
            SessionProtocol::Sftp => write!(f, "sftp"),
        }
    }
}

/// 已建立的远程会话
#[async_trait]
pub trait RemoteSession: Send {
    /// 远程文件大小，未知时为 None
    async fn size(&mut self, path: &str) -> Result<Option<u64>, LoaderError>;

    /// 从指定偏移打开读取流
    async fn open(
        &mut self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, LoaderError>;

    /// 是否支持从偏移处继续
    fn supports_resume(&self) -> bool;

    async fn close(&mut self) -> Result<(), LoaderError>;
}

/// 会话建立方
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        protocol: SessionProtocol,
        url: &Url,
        credentials: Option<Credentials>,
    ) -> Result<Box<dyn RemoteSession>, LoaderError>;
}

/// 会话 Loader
pub struct SessionLoader {
    protocol: SessionProtocol,
    connector: Option<Arc<dyn SessionConnector>>,
    host_policy: Arc<dyn HostPolicy>,
    auth: Arc<dyn AuthManager>,
    min_free_space: u64,
}

impl SessionLoader {
    pub fn new(protocol: SessionProtocol, ctx: &LoaderContext) -> Self {
        Self {
            protocol,
            connector: ctx.sessions.clone(),
            host_policy: Arc::clone(&ctx.host_policy),
            auth: Arc::clone(&ctx.auth),
            min_free_space: ctx.min_free_space,
        }
    }

    pub async fn fetch(
        &self,
        order: &Order,
        control: &LoaderControl,
        sink: &dyn ProgressSink,
    ) -> Result<Transferred, LoaderError> {
        let url = Url::parse(&order.source).map_err(|_| LoaderError::InvalidLocator {
            uri: order.source.clone(),
        })?;
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if self.host_policy.is_blocked(&host) {
            return Err(LoaderError::BlockedHost { host });
        }

        let Some(connector) = &self.connector else {
            return Err(LoaderError::ProtocolUnavailable {
                protocol: self.protocol.to_string(),
            });
        };

        let credentials = self.credentials_for(&url, &host);
        sink.on_status_message(&format!("connecting to {}", host), false);
        let mut session = tokio::select! {
            biased;
            _ = control.token().cancelled() => return Err(control.stop_error()),
            s = connector.connect(self.protocol, &url, credentials) => s?,
        };

        let result = self.transfer(session.as_mut(), &url, order, control, sink).await;
        if let Err(e) = session.close().await {
            warn!("关闭 {} 会话失败: {}", self.protocol, e);
        }
        result
    }

    /// 地址中的用户信息优先，其次按主机名向 AuthManager 查询
    fn credentials_for(&self, url: &Url, host: &str) -> Option<Credentials> {
        if !url.username().is_empty() {
            let userid = urlencoding::decode(url.username())
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| url.username().to_string());
            let password = url
                .password()
                .and_then(|p| urlencoding::decode(p).ok())
                .map(|p| p.into_owned())
                .unwrap_or_default();
            return Some(Credentials::new("password", userid, password));
        }
        self.auth.credentials(host)
    }

    async fn transfer(
        &self,
        session: &mut dyn RemoteSession,
        url: &Url,
        order: &Order,
        control: &LoaderControl,
        sink: &dyn ProgressSink,
    ) -> Result<Transferred, LoaderError> {
        let path = urlencoding::decode(url.path())
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| url.path().to_string());
        let destination = order.destination();

        let total = tokio::select! {
            biased;
            _ = control.token().cancelled() => return Err(control.stop_error()),
            size = session.size(&path) => size?,
        };
        match total {
            Some(size) => sink.on_content_length(size),
            None => sink.on_no_progress_available(),
        }

        let existing = match tokio::fs::metadata(&destination).await {
            Ok(m) if m.is_file() => m.len(),
            _ => 0,
        };
        let offset = if order.resume
            && self.protocol == SessionProtocol::Ftp
            && session.supports_resume()
            && existing > 0
            && total.map_or(true, |t| existing <= t)
        {
            info!("{} 续传: {:?} 从 {} bytes 继续", self.protocol, destination, existing);
            existing
        } else {
            0
        };

        if let Some(size) = total {
            storage::ensure_free_space(&order.folder, size - offset, self.min_free_space)?;
        }

        let mut reader = tokio::select! {
            biased;
            _ = control.token().cancelled() => return Err(control.stop_error()),
            reader = session.open(&path, offset) => reader?,
        };
        let mut writer = if offset > 0 {
            OpenOptions::new()
                .append(true)
                .open(&destination)
                .await
                .map_err(LoaderError::from_write)?
        } else {
            File::create(&destination)
                .await
                .map_err(LoaderError::from_write)?
        };

        let mut progress = ByteProgress::new(total, offset);
        let mut buf = vec![0u8; SESSION_BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                biased;
                _ = control.token().cancelled() => return Err(control.stop_error()),
                read = reader.read(&mut buf) => read.map_err(|e| LoaderError::Interrupted {
                    reason: e.to_string(),
                })?,
            };
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(LoaderError::from_write)?;
            progress.advance(n as u64);
            if let Some(fraction) = progress.fraction() {
                sink.on_progress(fraction, progress.eta());
            }
        }
        writer.flush().await.map_err(LoaderError::from_write)?;

        if let Some(size) = total {
            if progress.done() < size {
                return Err(LoaderError::Interrupted {
                    reason: format!("received {} of {} bytes", progress.done(), size),
                });
            }
        }
        debug!("{} 传输完成: {:?}", self.protocol, destination);

        Ok(Transferred {
            file: destination,
            bytes: progress.done() - offset,
            media_type: order.mime.clone(),
        })
    }
}

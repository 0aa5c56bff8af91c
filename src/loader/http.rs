//! HTTP(S) 下载
//!
//! 支持 Range 断点续传、Basic 认证、Referer，以及直播流的手动结束

use crate::loader::{
    storage, ByteProgress, LoaderContext, LoaderControl, LoaderError, ProgressSink, StopReason,
    Transferred,
};
use crate::model::{AuthChallenge, Order};
use crate::service::contracts::{AuthManager, Credentials, HostPolicy};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct HttpLoader {
    client: Client,
    host_policy: Arc<dyn HostPolicy>,
    auth: Arc<dyn AuthManager>,
    min_free_space: u64,
    read_timeout: Duration,
}

impl HttpLoader {
    pub fn new(ctx: &LoaderContext) -> Self {
        Self {
            client: ctx.client.clone(),
            host_policy: Arc::clone(&ctx.host_policy),
            auth: Arc::clone(&ctx.auth),
            min_free_space: ctx.min_free_space,
            read_timeout: ctx.read_timeout,
        }
    }

    /// 主机策略检查：屏蔽列表、明文传输
    fn check_host(&self, url: &Url) -> Result<String, LoaderError> {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if host.is_empty() {
            return Err(LoaderError::InvalidLocator {
                uri: url.to_string(),
            });
        }
        if self.host_policy.is_blocked(&host) {
            return Err(LoaderError::BlockedHost { host });
        }
        if url.scheme() == "http" && !self.host_policy.permits_cleartext(&host) {
            return Err(LoaderError::CleartextNotPermitted { host });
        }
        Ok(host)
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
        let host = self.check_host(&url)?;
        let destination = order.destination();

        if let Some(expected) = order.expected_size {
            storage::ensure_free_space(&order.folder, expected, self.min_free_space)?;
        }

        // 只有续传派发才沿用已有的部分文件
        let offset = if order.resume {
            match tokio::fs::metadata(&destination).await {
                Ok(m) if m.is_file() => m.len(),
                _ => 0,
            }
        } else {
            0
        };

        let mut request = self.client.get(url.clone());
        if let Some(referer) = &order.referer {
            request = request.header(header::REFERER, referer);
        }
        if let Some(creds) = self.credentials_for(order, &host) {
            debug!("使用 realm 凭证访问 {}", host);
            request = request.basic_auth(creds.userid, Some(creds.password));
        }
        if offset > 0 {
            info!("续传: {:?} 从 {} bytes 继续", destination, offset);
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        sink.on_buffering(0);
        let response = tokio::select! {
            biased;
            _ = control.token().cancelled() => return Err(control.stop_error()),
            resp = request.send() => resp.map_err(|e| LoaderError::from_reqwest(e, &host))?,
        };
        sink.on_buffering(100);

        let status = response.status();
        debug!("HTTP 响应: {} {}", status, url);
        let headers = response.headers().clone();
        let media_type = media_type_of(&headers).or_else(|| order.mime.clone());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Transferred {
                file: destination,
                bytes: 0,
                media_type,
            });
        }

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // 服务器声明的总长度与本地一致（或未声明）时视为已完成
            let complete = range_total(&headers).map_or(true, |total| total == offset);
            if complete {
                info!("部分文件已完整: {:?}", destination);
                return Ok(Transferred {
                    file: destination,
                    bytes: 0,
                    media_type,
                });
            }
        }

        if status == StatusCode::UNAUTHORIZED {
            let challenge = headers
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(AuthChallenge::parse);
            return Err(LoaderError::Http {
                status: status.as_u16(),
                host,
                challenge,
            });
        }

        if !status.is_success() {
            return Err(LoaderError::Http {
                status: status.as_u16(),
                host,
                challenge: None,
            });
        }

        let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !resuming {
            warn!("服务器不支持 Range 请求，从头开始: {}", url);
        }
        let start = if resuming { offset } else { 0 };

        if let Some(name) = disposition_filename(&headers) {
            sink.on_resource_name_resolved(&name);
        }

        let body_len = response.content_length();
        let total = body_len.map(|len| len + start);
        match total {
            Some(total) => {
                sink.on_content_length(total);
                storage::ensure_free_space(&order.folder, total - start, self.min_free_space)?;
            }
            None => sink.on_no_progress_available(),
        }

        let mut file = if resuming {
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

        let mut progress = ByteProgress::new(total, start);
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = control.token().cancelled() => {
                    if control.reason() == StopReason::FinishLive {
                        info!("手动结束接收: {:?}, {} bytes", destination, progress.done());
                        break;
                    }
                    return Err(control.stop_error());
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(LoaderError::Timeout { host }),
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(LoaderError::Interrupted {
                        reason: e.to_string(),
                    })
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk)
                .await
                .map_err(LoaderError::from_write)?;
            progress.advance(chunk.len() as u64);
            if let Some(fraction) = progress.fraction() {
                sink.on_progress(fraction, progress.eta());
            }
        }
        file.flush().await.map_err(LoaderError::from_write)?;

        if control.reason() != StopReason::FinishLive {
            if let Some(total) = total {
                if progress.done() < total {
                    return Err(LoaderError::Interrupted {
                        reason: format!("received {} of {} bytes", progress.done(), total),
                    });
                }
            }
        }

        Ok(Transferred {
            file: destination,
            bytes: progress.done() - start,
            media_type,
        })
    }

    /// 按 Wish 的认证提示取凭证，没有提示时按主机名查找
    fn credentials_for(&self, order: &Order, host: &str) -> Option<Credentials> {
        let realm = order
            .wish
            .as_ref()
            .and_then(|w| w.auth.as_ref())
            .map(|a| a.realm.as_str())
            .unwrap_or(host);
        self.auth
            .credentials(realm)
            .filter(|c| c.scheme.eq_ignore_ascii_case("basic"))
    }
}

/// Content-Type 的主体部分
fn media_type_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

/// `Content-Range: bytes */N` 中的总长度
fn range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|v| v.trim().parse().ok())
}

/// Content-Disposition 中的文件名，`filename*` 优先
fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())?;

    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        let Some((key, val)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim();
        if key == "filename*" {
            // RFC 5987: charset'lang'encoded
            let encoded = val.splitn(3, '\'').nth(2).unwrap_or(val);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        } else if key == "filename" {
            let name = val.trim_matches('"');
            if !name.is_empty() {
                plain = Some(name.to_string());
            }
        }
    }
    plain
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(name, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn test_media_type() {
        let h = headers(header::CONTENT_TYPE, "Text/HTML; charset=utf-8");
        assert_eq!(media_type_of(&h).as_deref(), Some("text/html"));
        assert_eq!(media_type_of(&HeaderMap::new()), None);
    }

    #[test]
    fn test_range_total() {
        let h = headers(header::CONTENT_RANGE, "bytes */1000");
        assert_eq!(range_total(&h), Some(1000));
        let h = headers(header::CONTENT_RANGE, "bytes 0-99/*");
        assert_eq!(range_total(&h), None);
    }

    #[test]
    fn test_disposition_filename() {
        let h = headers(header::CONTENT_DISPOSITION, r#"attachment; filename="report.pdf""#);
        assert_eq!(disposition_filename(&h).as_deref(), Some("report.pdf"));

        let h = headers(
            header::CONTENT_DISPOSITION,
            r#"attachment; filename="fallback.txt"; filename*=UTF-8''na%C3%AFve.txt"#,
        );
        assert_eq!(disposition_filename(&h).as_deref(), Some("naïve.txt"));

        let h = headers(header::CONTENT_DISPOSITION, "inline");
        assert_eq!(disposition_filename(&h), None);
    }
}

//! 本地内容复制

use crate::loader::{storage, ByteProgress, LoaderControl, LoaderError, ProgressSink, Transferred};
use crate::model::Order;
use reqwest::Url;
use std::io;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// 本地复制 Loader
///
/// 续传时总是从头开始
#[derive(Debug, Default, Clone)]
pub struct LocalCopyLoader;

impl LocalCopyLoader {
    pub fn new() -> Self {
        Self
    }

    pub async fn fetch(
        &self,
        order: &Order,
        control: &LoaderControl,
        sink: &dyn ProgressSink,
    ) -> Result<Transferred, LoaderError> {
        let source = source_path(&order.source)?;
        let destination = order.destination();
        debug!("本地复制: {:?} -> {:?}", source, destination);

        let mut reader = match File::open(&source).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LoaderError::NoSourceFound {
                    source_uri: order.source.clone(),
                })
            }
            Err(e) => return Err(LoaderError::Io(e)),
        };
        let metadata = reader.metadata().await.map_err(LoaderError::Io)?;
        if metadata.is_dir() {
            return Err(LoaderError::NoSourceFound {
                source_uri: order.source.clone(),
            });
        }

        let total = metadata.len();
        sink.on_content_length(total);
        storage::ensure_free_space(&order.folder, total, 0)?;

        let mut writer = File::create(&destination)
            .await
            .map_err(LoaderError::from_write)?;
        let mut progress = ByteProgress::new(Some(total), 0);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

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

        Ok(Transferred {
            file: destination,
            bytes: progress.done(),
            media_type: order.mime.clone(),
        })
    }
}

/// `file://` 地址或绝对路径
fn source_path(source: &str) -> Result<PathBuf, LoaderError> {
    if source.starts_with('/') {
        return Ok(PathBuf::from(source));
    }
    let url = Url::parse(source).map_err(|_| LoaderError::InvalidLocator {
        uri: source.to_string(),
    })?;
    match url.scheme() {
        "file" => url.to_file_path().map_err(|_| LoaderError::InvalidLocator {
            uri: source.to_string(),
        }),
        other => Err(LoaderError::ProtocolUnavailable {
            protocol: other.to_string(),
        }),
    }
}

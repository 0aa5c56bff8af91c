use serde::{Deserialize, Serialize};

/// 传输协议类型（决定使用哪一种 Loader 变体）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    /// HTTP(S) 下载（支持 Range 断点续传）
    Http,
    /// FTP 会话传输
    Ftp,
    /// SFTP 会话传输
    Sftp,
    /// 本地内容复制
    LocalCopy,
    /// 流媒体转码捕获（无固定长度）
    Transcode,
}

/// 流媒体播放列表后缀，命中时走转码捕获
const STREAM_SUFFIXES: &[&str] = &[".m3u8", ".mpd"];

impl LoaderKind {
    /// 根据资源地址和可选的处理器提示选择 Loader 变体
    ///
    /// 纯函数：显式提示优先，否则按 scheme 判断。
    /// 无法识别的 scheme 返回 None。
    pub fn select(uri: &str, hint: Option<LoaderKind>) -> Option<LoaderKind> {
        if let Some(kind) = hint {
            return Some(kind);
        }

        // 绝对路径直接按本地复制处理
        if uri.starts_with('/') {
            return Some(LoaderKind::LocalCopy);
        }

        let scheme = uri.split_once(':').map(|(s, _)| s.to_ascii_lowercase())?;
        match scheme.as_str() {
            "http" | "https" => {
                let path = uri
                    .split(['?', '#'])
                    .next()
                    .unwrap_or(uri)
                    .to_ascii_lowercase();
                if STREAM_SUFFIXES.iter().any(|s| path.ends_with(s)) {
                    Some(LoaderKind::Transcode)
                } else {
                    Some(LoaderKind::Http)
                }
            }
            "ftp" | "ftps" => Some(LoaderKind::Ftp),
            "sftp" | "scp" => Some(LoaderKind::Sftp),
            "file" => Some(LoaderKind::LocalCopy),
            "rtmp" | "rtsp" | "mms" => Some(LoaderKind::Transcode),
            _ => None,
        }
    }

    /// 是否支持从部分文件继续
    pub fn supports_resume(&self) -> bool {
        matches!(self, LoaderKind::Http | LoaderKind::Ftp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderKind::Http => "http",
            LoaderKind::Ftp => "ftp",
            LoaderKind::Sftp => "sftp",
            LoaderKind::LocalCopy => "local_copy",
            LoaderKind::Transcode => "transcode",
        }
    }
}

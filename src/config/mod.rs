// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 网络配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 转码捕获配置
    #[serde(default)]
    pub transcode: TranscodeConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 下载根目录（必须是绝对路径）
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 同时运行的 Loader 上限（仅 submit_or_queue 使用）
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 写入后至少保留的磁盘空间 (MB)
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

fn default_download_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("/"))
        .join("downloads")
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_min_free_space_mb() -> u64 {
    64
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl DownloadConfig {
    /// 验证下载路径是否为绝对路径
    pub fn validate_download_dir(&self) -> Result<()> {
        if !self.download_dir.is_absolute() {
            anyhow::bail!(
                "下载目录必须是绝对路径，当前值: {:?}\n\
                 Linux 示例: /home/user/downloads",
                self.download_dir
            );
        }

        tracing::debug!("路径格式验证通过（绝对路径）: {:?}", self.download_dir);
        Ok(())
    }

    /// 确保下载目录存在（不存在则自动创建）
    pub async fn ensure_download_dir_exists(&self) -> Result<()> {
        self.validate_download_dir()?;
        fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| format!("无法创建下载目录: {:?}", self.download_dir))?;
        Ok(())
    }

    pub fn min_free_space_bytes(&self) -> u64 {
        self.min_free_space_mb * 1024 * 1024
    }
}

/// 网络配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 两次读取之间的最长等待（秒）
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 最多跟随的重定向次数
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// 屏蔽的主机（后缀匹配）
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// 禁止明文 HTTP 的主机（后缀匹配，"*" 表示全部）
    #[serde(default)]
    pub cleartext_denied_hosts: Vec<String>,
    /// 全局代理，如 `socks5://127.0.0.1:1080`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_user_agent() -> String {
    format!("loader-service/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_max_redirects() -> usize {
    10
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_redirects: default_max_redirects(),
            blocked_hosts: Vec::new(),
            cleartext_denied_hosts: Vec::new(),
            proxy: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// 转码捕获配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// 捕获程序
    #[serde(default = "default_transcode_program")]
    pub program: String,
    /// 放在输出路径之前的额外参数
    #[serde(default = "default_transcode_args")]
    pub extra_args: Vec<String>,
}

fn default_transcode_program() -> String {
    "ffmpeg".to_string()
}

fn default_transcode_args() -> Vec<String> {
    vec!["-c".to_string(), "copy".to_string()]
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: default_transcode_program(),
            extra_args: default_transcode_args(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate_download_dir()
            .context("配置文件中的下载路径验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate_download_dir()
            .context("保存配置失败：下载路径必须是绝对路径")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.download.download_dir.is_absolute());
        assert_eq!(config.download.max_concurrent_tasks, 3);
        assert_eq!(config.transcode.program, "ffmpeg");
        assert_eq!(config.network.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.network.blocked_hosts = vec!["ads.example".to_string()];
        config.network.proxy = Some("socks5://127.0.0.1:1080".to_string());
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.network.blocked_hosts, config.network.blocked_hosts);
        assert_eq!(loaded.network.proxy, config.network.proxy);
        assert_eq!(loaded.download.download_dir, config.download.download_dir);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(
            path,
            "[download]\ndownload_dir = \"/srv/downloads\"\n\n[network]\nread_timeout_secs = 5\n",
        )
        .unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.download_dir, PathBuf::from("/srv/downloads"));
        assert_eq!(loaded.download.max_concurrent_tasks, 3);
        assert_eq!(loaded.network.read_timeout(), Duration::from_secs(5));
        assert_eq!(loaded.transcode.extra_args, vec!["-c", "copy"]);
    }

    #[tokio::test]
    async fn test_relative_download_dir_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(path, "[download]\ndownload_dir = \"downloads\"\n").unwrap();
        assert!(AppConfig::load_from_file(path).await.is_err());
    }
}

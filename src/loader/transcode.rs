//! 流媒体转码捕获
//!
//! 调用外部程序（默认 ffmpeg）把播放列表或直播流写入本地文件，
//! 通过解析 stderr 中的 `Duration:` 和 `time=` 得到绝对进度。

use crate::config::TranscodeConfig;
use crate::loader::{LoaderControl, LoaderError, ProgressSink, StopReason, Transferred};
use crate::model::Order;
use regex::Regex;
use std::io;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// stderr 进度解析
struct StderrParser {
    duration: Regex,
    time: Regex,
}

/// 一行 stderr 的解析结果
#[derive(Debug, PartialEq, Eq)]
enum StderrLine {
    /// 总时长（毫秒），None 表示直播流
    Duration(Option<u64>),
    /// 已处理时长（毫秒）
    Time(u64),
    Other,
}

impl StderrParser {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            duration: Regex::new(r"Duration:\s*(N/A|(\d+):(\d{2}):(\d{2})(?:\.(\d+))?)")?,
            time: Regex::new(r"time=\s*(-?)(\d+):(\d{2}):(\d{2})(?:\.(\d+))?")?,
        })
    }

    fn parse(&self, line: &str) -> StderrLine {
        if let Some(caps) = self.duration.captures(line) {
            if &caps[1] == "N/A" {
                return StderrLine::Duration(None);
            }
            return StderrLine::Duration(clock_to_ms(
                caps.get(2).map(|m| m.as_str()),
                caps.get(3).map(|m| m.as_str()),
                caps.get(4).map(|m| m.as_str()),
                caps.get(5).map(|m| m.as_str()),
            ));
        }
        if let Some(caps) = self.time.captures(line) {
            // 负的 time= 出现在开头的预读阶段
            if &caps[1] == "-" {
                return StderrLine::Time(0);
            }
            if let Some(ms) = clock_to_ms(
                caps.get(2).map(|m| m.as_str()),
                caps.get(3).map(|m| m.as_str()),
                caps.get(4).map(|m| m.as_str()),
                caps.get(5).map(|m| m.as_str()),
            ) {
                return StderrLine::Time(ms);
            }
        }
        StderrLine::Other
    }
}

/// HH:MM:SS.frac -> 毫秒
fn clock_to_ms(h: Option<&str>, m: Option<&str>, s: Option<&str>, frac: Option<&str>) -> Option<u64> {
    let h: u64 = h?.parse().ok()?;
    let m: u64 = m?.parse().ok()?;
    let s: u64 = s?.parse().ok()?;
    let frac_ms = match frac {
        Some(f) => {
            // 只取前三位，不足补零
            let digits: String = f.chars().chain("000".chars()).take(3).collect();
            digits.parse::<u64>().ok()?
        }
        None => 0,
    };
    Some(((h * 60 + m) * 60 + s) * 1000 + frac_ms)
}

pub struct TranscodeLoader {
    program: String,
    extra_args: Vec<String>,
}

impl TranscodeLoader {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn build_args(&self, order: &Order) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-y".to_string()];
        args.push("-i".to_string());
        args.push(order.source.clone());
        for aux in &order.aux_urls {
            args.push("-i".to_string());
            args.push(aux.clone());
        }
        if !order.aux_urls.is_empty() {
            for index in 0..=order.aux_urls.len() {
                args.push("-map".to_string());
                args.push(index.to_string());
            }
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(order.destination().to_string_lossy().into_owned());
        args
    }

    pub async fn fetch(
        &self,
        order: &Order,
        control: &LoaderControl,
        sink: &dyn ProgressSink,
    ) -> Result<Transferred, LoaderError> {
        let parser = StderrParser::new().map_err(|e| LoaderError::Internal(e.to_string()))?;
        let destination = order.destination();
        let args = self.build_args(order);
        debug!("启动转码: {} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => LoaderError::TranscodeFailed {
                    reason: format!("capture backend not found: {}", self.program),
                },
                _ => LoaderError::TranscodeFailed {
                    reason: format!("failed to start {}: {}", self.program, e),
                },
            })?;

        let stderr = child.stderr.take().ok_or_else(|| LoaderError::TranscodeFailed {
            reason: "stderr not captured".to_string(),
        })?;
        let mut stdin = child.stdin.take();
        let mut lines = BufReader::new(stderr).lines();

        sink.on_buffering(0);
        let started = Instant::now();
        let mut total_ms: Option<u64> = None;
        let mut live_reported = false;
        let mut finishing = false;
        let mut last_line = String::new();

        loop {
            tokio::select! {
                biased;
                _ = control.token().cancelled(), if !finishing => {
                    if control.reason() == StopReason::FinishLive {
                        info!("请求结束捕获: {:?}", destination);
                        finishing = true;
                        if let Some(mut input) = stdin.take() {
                            if let Err(e) = input.write_all(b"q").await {
                                warn!("写入结束指令失败: {}", e);
                            }
                        }
                    } else {
                        if let Err(e) = child.kill().await {
                            warn!("终止转码进程失败: {}", e);
                        }
                        return Err(control.stop_error());
                    }
                }
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    match parser.parse(&line) {
                        StderrLine::Duration(Some(ms)) => {
                            total_ms = Some(ms);
                            sink.on_buffering(100);
                        }
                        StderrLine::Duration(None) => {
                            if !live_reported {
                                live_reported = true;
                                sink.on_live_stream_detected();
                            }
                        }
                        StderrLine::Time(elapsed_ms) => {
                            sink.on_absolute_progress(elapsed_ms, total_ms, eta_secs(started, elapsed_ms, total_ms));
                        }
                        StderrLine::Other => {}
                    }
                    if !line.trim().is_empty() {
                        last_line = line;
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| LoaderError::TranscodeFailed {
            reason: e.to_string(),
        })?;

        // 手动结束时退出码不可靠，以输出文件为准
        let produced = tokio::fs::metadata(&destination)
            .await
            .map(|m| m.len())
            .ok();
        if !(status.success() || (finishing && produced.is_some())) {
            let reason = if last_line.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                last_line
            };
            return Err(LoaderError::TranscodeFailed { reason });
        }

        let Some(bytes) = produced else {
            return Err(LoaderError::TranscodeFailed {
                reason: "no output produced".to_string(),
            });
        };

        Ok(Transferred {
            file: destination,
            bytes,
            media_type: order.mime.clone(),
        })
    }
}

/// 按已用时间和处理进度估算剩余秒数
fn eta_secs(started: Instant, elapsed_ms: u64, total_ms: Option<u64>) -> Option<u64> {
    let total = total_ms?;
    if elapsed_ms == 0 || elapsed_ms >= total {
        return None;
    }
    let wall_ms = started.elapsed().as_millis() as u64;
    Some(wall_ms * (total - elapsed_ms) / elapsed_ms / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LoaderKind;
    use std::path::PathBuf;

    #[test]
    fn test_parse_stderr() {
        let parser = StderrParser::new().unwrap();
        assert_eq!(
            parser.parse("  Duration: 00:01:02.50, start: 0.000000, bitrate: 128 kb/s"),
            StderrLine::Duration(Some(62_500))
        );
        assert_eq!(
            parser.parse("  Duration: N/A, start: 1.4, bitrate: N/A"),
            StderrLine::Duration(None)
        );
        assert_eq!(
            parser.parse("frame=  100 fps= 25 q=-1.0 size=    1024kB time=00:00:04.04 bitrate=2076.4kbits/s"),
            StderrLine::Time(4_040)
        );
        assert_eq!(parser.parse("size=0kB time=-00:00:00.05"), StderrLine::Time(0));
        assert_eq!(parser.parse("Stream #0:0: Video: h264"), StderrLine::Other);
    }

    #[test]
    fn test_build_args_with_aux_tracks() {
        let loader = TranscodeLoader::new(&TranscodeConfig {
            program: "ffmpeg".to_string(),
            extra_args: vec!["-c".to_string(), "copy".to_string()],
        });
        let mut order = Order::new(
            LoaderKind::Transcode,
            "https://host/v.m3u8",
            PathBuf::from("/d"),
            "v.mp4",
        );
        order.aux_urls.push("https://host/a.m3u8".to_string());
        let args = loader.build_args(&order);
        assert_eq!(
            args,
            vec![
                "-hide_banner", "-y", "-i", "https://host/v.m3u8", "-i", "https://host/a.m3u8",
                "-map", "0", "-map", "1", "-c", "copy", "/d/v.mp4"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_backend() {
        let dir = tempfile::tempdir().unwrap();
        let loader = TranscodeLoader::new(&TranscodeConfig {
            program: "definitely-not-a-capture-backend".to_string(),
            extra_args: Vec::new(),
        });
        let order = Order::new(
            LoaderKind::Transcode,
            "rtsp://cam/stream",
            dir.path().to_path_buf(),
            "cam.mp4",
        );
        let result = loader
            .fetch(&order, &LoaderControl::new(), &crate::loader::NullSink)
            .await;
        match result {
            Err(LoaderError::TranscodeFailed { reason }) => assert!(reason.contains("not found")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}

use loader_service::{
    logging,
    service::{ConfigHostPolicy, Outcome, ServiceEvent},
    AppConfig, LoaderService, Wish,
};
use std::sync::Arc;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let _log_guard = logging::init_logging(&config.log);

    let uris: Vec<String> = std::env::args().skip(1).collect();
    if uris.is_empty() {
        eprintln!("用法: loader-service <地址>...");
        return Ok(());
    }

    config.download.ensure_download_dir_exists().await?;
    info!("下载目录: {:?}", config.download.download_dir);

    let policy = Arc::new(ConfigHostPolicy::from_config(&config.network));
    let service = LoaderService::builder(config).host_policy(policy).build()?;
    let (_subscription, mut events) = service.subscribe();

    let mut pending = 0usize;
    for uri in uris {
        match service.submit_or_queue(Wish::new(uri.clone())).await {
            Ok(Some(id)) => {
                info!("{} 开始下载: {}", id, uri);
                pending += 1;
            }
            Ok(None) => {
                info!("已排队: {}", uri);
                pending += 1;
            }
            Err(e) => error!("无法下载 {}: {:#}", uri, e),
        }
    }
    if pending == 0 {
        return Ok(());
    }

    let mut failed = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，取消所有下载...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ServiceEvent::Progress { id, fraction, eta_secs } => {
                        info!("{} 进度 {:.1}% 剩余 {:?}s", id, fraction * 100.0, eta_secs);
                    }
                    ServiceEvent::LiveStreamDetected { id } => {
                        info!("{} 是直播流，没有总长度", id);
                    }
                    ServiceEvent::Finished { id, file, classification, .. } => {
                        match classification.outcome {
                            Outcome::Success => info!("{} 完成: {:?}", id, file),
                            Outcome::Failed => {
                                failed += 1;
                                warn!(
                                    "{} 失败: {} 可选操作: {:?}",
                                    id,
                                    classification.reason.unwrap_or_default(),
                                    classification.actions
                                );
                            }
                            other => info!("{} 结束: {:?}", id, other),
                        }
                    }
                    ServiceEvent::DispatchFailed { wish, reason } => {
                        failed += 1;
                        warn!("排队的 {} 无法派发: {}", wish.uri, reason);
                    }
                    ServiceEvent::Idle => {
                        if service.queue().is_empty().await {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    service.shutdown();
    info!("应用已退出，失败 {} 个", failed);
    if failed > 0 {
        anyhow::bail!("{} 个下载失败", failed);
    }
    Ok(())
}

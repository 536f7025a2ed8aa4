use resumable_uploader::{
    logging, LocalBlockCommitClient, LocalRangeWriteClient, PrefixDestinationResolver,
    StaticCredentialBroker, StorageClients, UploadEvent, UploadFile, Uploader, UploaderConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 配置文件路径环境变量
const CONFIG_ENV: &str = "UPLOADER_CONFIG";

/// 目标目录环境变量（本地存储客户端的根目录）
const DEST_DIR_ENV: &str = "UPLOADER_DEST_DIR";

const DEFAULT_CONFIG_PATH: &str = "uploader.toml";
const DEFAULT_DEST_DIR: &str = "uploads";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = UploaderConfig::load_or_default(&config_path).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Resumable Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("用法: resumable-uploader <文件>...");
        return Ok(ExitCode::from(2));
    }

    let dest_dir =
        PathBuf::from(std::env::var(DEST_DIR_ENV).unwrap_or_else(|_| DEFAULT_DEST_DIR.to_string()));
    let clients = StorageClients {
        range_write: Some(Arc::new(LocalRangeWriteClient::new(&dest_dir))),
        block_commit: Some(Arc::new(LocalBlockCommitClient::new(&dest_dir))),
    };

    let uploader = Uploader::with_storage(
        config,
        clients,
        Arc::new(PrefixDestinationResolver::default()),
        Arc::new(StaticCredentialBroker::new("local")),
        None,
    )?;

    let mut events = uploader.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                UploadEvent::FileProgress {
                    file_name,
                    progress,
                    speed,
                    eta,
                } => {
                    info!(
                        "{}: {:.2}% ({:.2} MB/s, 剩余 {:.1}s)",
                        file_name, progress, speed, eta
                    );
                }
                other => match serde_json::to_string(other) {
                    Ok(json) => info!("事件: {}", json),
                    Err(e) => warn!("序列化事件失败: {}", e),
                },
            }
        }
    });

    let mut files = Vec::with_capacity(paths.len());
    let mut failed = 0usize;
    for path in paths {
        match UploadFile::from_path(&path).await {
            Ok(file) => files.push(file),
            Err(e) => {
                error!("无法读取文件 {:?}: {}", path, e);
                failed += 1;
            }
        }
    }

    let results = uploader.upload_files(files).await;
    for (name, result) in &results {
        match result {
            Ok(outcome) => info!("{}: {:?}", name, outcome),
            Err(e) => {
                error!("{}: {}", name, e);
                failed += 1;
            }
        }
    }

    uploader.destroy().await;
    drop(uploader);
    if let Err(e) = printer.await {
        warn!("事件输出任务异常退出: {}", e);
    }

    let succeeded = results.iter().filter(|(_, result)| result.is_ok()).count();
    info!(
        "上传结束: 成功 {} 个, 失败 {} 个, 目标目录 {:?}",
        succeeded,
        failed,
        dest_dir
    );

    // 不调用 process::exit，_log_guard 需要在返回时析构
    Ok(ExitCode::from(exit_status(failed)))
}

/// 有文件失败时以 1 退出
fn exit_status(failed: usize) -> u8 {
    if failed > 0 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_reflects_failures() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(1), 1);
        assert_eq!(exit_status(5), 1);
    }
}

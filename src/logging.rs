//! 日志系统配置
//!
//! 控制台输出 + 按天滚动的日志文件，可选额外输出仅包含 ERROR 的日志文件，
//! 启动时清理超过保留天数的日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "resumable-uploader";

/// 普通日志文件名（滚动后追加 `.YYYY-MM-DD`）
const INFO_LOG_NAME: &str = "resumable-uploader.log";

/// ERROR 日志文件名
const ERROR_LOG_NAME: &str = "resumable-uploader.error.log";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let mut guards = Vec::new();
    let mut file_layer = None;
    let mut error_layer = None;

    if config.enabled {
        match fs::create_dir_all(&config.log_dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&config.log_dir, INFO_LOG_NAME);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                guards.push(guard);
                file_layer = Some(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                        .with_ansi(false)
                        .with_writer(writer),
                );

                if config.error_file {
                    let appender =
                        tracing_appender::rolling::daily(&config.log_dir, ERROR_LOG_NAME);
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    guards.push(guard);
                    error_layer = Some(
                        fmt::layer()
                            .with_target(true)
                            .with_level(true)
                            .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_filter(LevelFilter::ERROR),
                    );
                }
            }
            Err(e) => {
                // 回退到只使用控制台输出
                eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
            }
        }
    }

    let file_enabled = file_layer.is_some();
    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(error_layer)
        .try_init()
    {
        eprintln!("日志系统已初始化，忽略重复初始化: {}", e);
    }

    if file_enabled {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, ERROR 日志={}",
            config.log_dir, config.retention_days, config.level, config.error_file
        );
        cleanup_old_logs(&config.log_dir, config.retention_days);
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guards: guards,
    }
}

/// 清理过期日志文件，返回删除的文件数
///
/// 文件名格式：
/// - resumable-uploader.log.YYYY-MM-DD
/// - resumable-uploader.error.log.YYYY-MM-DD
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !filename.starts_with(LOG_FILE_PREFIX) {
            continue;
        }

        let expired = match extract_date_from_filename(filename) {
            Some(date) => today.signed_duration_since(date) > retention,
            // 当天尚未滚动的文件等无日期后缀的文件按修改时间判断
            None => check_by_modified_time(&entry, retention),
        };

        if expired {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    if deleted_count > 0 {
        info!("已清理 {} 个过期日志文件", deleted_count);
    }
    deleted_count
}

/// 从文件名末尾提取日期（`*.log.YYYY-MM-DD`）
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let (_, suffix) = filename.rsplit_once(".log.")?;
    chrono::NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// 根据文件修改时间检查是否过期
fn check_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
        return false;
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified) > retention
}

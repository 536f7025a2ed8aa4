// 配置管理模块

use crate::error::{UploadError, UploadResult};
use crate::storage::StorageVariant;
use crate::uploader::chunk::{DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 上传器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 最大并发上传分片数（默认并发，自适应调整的基准）
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 存储类型：range_write / block_commit
    #[serde(default = "default_storage_variant")]
    pub storage_variant: String,
    /// 最小分片大小（字节）
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 最大分片大小（字节）
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// 凭证续期周期（秒）
    #[serde(default = "default_token_renewal_secs")]
    pub token_renewal_secs: u64,
    /// 是否启用自适应并发
    #[serde(default = "default_adaptive_concurrency")]
    pub adaptive_concurrency: bool,
    /// 分片传输重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 进度存储配置
    #[serde(default)]
    pub progress_store: ProgressStoreConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_max_concurrent_uploads() -> usize {
    5
}

fn default_storage_variant() -> String {
    "block_commit".to_string()
}

fn default_min_chunk_size() -> u64 {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_max_chunk_size() -> u64 {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_token_renewal_secs() -> u64 {
    300
}

fn default_adaptive_concurrency() -> bool {
    true
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            storage_variant: default_storage_variant(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            token_renewal_secs: default_token_renewal_secs(),
            adaptive_concurrency: default_adaptive_concurrency(),
            retry: RetryConfig::default(),
            progress_store: ProgressStoreConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl UploaderConfig {
    /// 凭证续期周期
    pub fn token_renewal_period(&self) -> Duration {
        Duration::from_secs(self.token_renewal_secs)
    }

    /// 解析存储类型
    pub fn storage_variant(&self) -> UploadResult<StorageVariant> {
        self.storage_variant.parse()
    }

    /// 校验配置
    pub fn validate(&self) -> UploadResult<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(UploadError::Config(
                "max_concurrent_uploads 必须大于 0".to_string(),
            ));
        }
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            return Err(UploadError::Config(format!(
                "分片大小范围无效: min_chunk_size={}, max_chunk_size={}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(UploadError::Config(
                "retry.max_attempts 必须大于 0".to_string(),
            ));
        }
        self.storage_variant()?;
        Ok(())
    }

    /// 从 TOML 文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: UploaderConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 保存配置到 TOML 文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败：配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// 分片传输重试配置
///
/// 第 n 次重试前等待 min(base_delay_ms × 2ⁿ, max_delay_ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数（包含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// 进度存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStoreKind {
    /// 进程内存储（重启后丢失）
    Memory,
    /// JSON 文件存储
    File,
}

/// 进度存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStoreConfig {
    #[serde(default = "default_progress_store_kind")]
    pub kind: ProgressStoreKind,
    /// 文件存储目录
    #[serde(default = "default_progress_dir")]
    pub dir: PathBuf,
}

fn default_progress_store_kind() -> ProgressStoreKind {
    ProgressStoreKind::File
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("progress")
}

impl Default for ProgressStoreConfig {
    fn default() -> Self {
        Self {
            kind: default_progress_store_kind(),
            dir: default_progress_dir(),
        }
    }
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
    /// 是否额外输出仅包含 ERROR 级别的日志文件
    #[serde(default)]
    pub error_file: bool,
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

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            error_file: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = UploaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_uploads, 5);
        assert_eq!(config.min_chunk_size, 1024 * 1024);
        assert_eq!(config.max_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.storage_variant().unwrap(), StorageVariant::BlockCommit);
        assert_eq!(config.token_renewal_period(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: UploaderConfig = toml::from_str(
            r#"
            storage_variant = "range-write"
            max_chunk_size = 8388608

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_variant().unwrap(), StorageVariant::RangeWrite);
        assert_eq!(config.max_chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.progress_store.kind, ProgressStoreKind::File);
        assert!(config.adaptive_concurrency);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = UploaderConfig::default();
        config.storage_variant = "ftp".to_string();
        assert!(matches!(
            config.validate(),
            Err(UploadError::InvalidBackendConfiguration(_))
        ));

        let mut config = UploaderConfig::default();
        config.min_chunk_size = config.max_chunk_size + 1;
        assert!(matches!(config.validate(), Err(UploadError::Config(_))));

        let mut config = UploaderConfig::default();
        config.max_concurrent_uploads = 0;
        assert!(matches!(config.validate(), Err(UploadError::Config(_))));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/uploader.toml");

        let mut config = UploaderConfig::default();
        config.max_concurrent_uploads = 8;
        config.progress_store.kind = ProgressStoreKind::Memory;
        config.save_to_file(&path).await.unwrap();

        let loaded = UploaderConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.max_concurrent_uploads, 8);
        assert_eq!(loaded.progress_store.kind, ProgressStoreKind::Memory);
    }

    #[tokio::test]
    async fn test_load_or_default_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = UploaderConfig::load_or_default(dir.path().join("missing.toml")).await;
        assert_eq!(config.max_concurrent_uploads, 5);
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
        assert!(!config.error_file);
    }
}

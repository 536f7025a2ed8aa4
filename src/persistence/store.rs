//! 进度存储
//!
//! `ProgressStore` 是外部的持久化键值存储接口，这里提供两个实现：
//! - `MemoryProgressStore`：进程内存储（默认，以及测试使用）
//! - `JsonFileProgressStore`：每个键一个 JSON 文件，写临时文件后原子重命名

use super::types::ProgressRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// 进度文件扩展名
const PROGRESS_EXTENSION: &str = "progress.json";

/// 进度存储接口
///
/// 查询从未写入过的键必须返回 `Ok(None)`，删除不存在的键必须成功
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ProgressRecord>>;

    async fn set(&self, key: &str, record: &ProgressRecord) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// 内存进度存储
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: DashMap<String, ProgressRecord>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前保存的记录数
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, key: &str) -> Result<Option<ProgressRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, record: &ProgressRecord) -> Result<()> {
        self.records.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }
}

/// JSON 文件进度存储
///
/// 文件名为键的 SHA-256 十六进制摘要，避免键中的路径分隔符等字符
#[derive(Debug, Clone)]
pub struct JsonFileProgressStore {
    dir: PathBuf,
}

impl JsonFileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 存储目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 获取键对应的文件路径：`{dir}/{sha256(key)}.progress.json`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), PROGRESS_EXTENSION))
    }
}

#[async_trait]
impl ProgressStore for JsonFileProgressStore {
    async fn get(&self, key: &str) -> Result<Option<ProgressRecord>> {
        let path = self.path_for(key);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("读取进度文件失败: {:?}", path));
            }
        };

        match serde_json::from_slice::<ProgressRecord>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // 损坏的进度文件视为不存在，从头上传
                warn!("进度文件已损坏，忽略: {:?}, 错误: {}", path, e);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, record: &ProgressRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("创建进度目录失败: {:?}", self.dir))?;

        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_vec_pretty(record).context("序列化进度记录失败")?;
        fs::write(&temp_path, content)
            .await
            .with_context(|| format!("写入进度临时文件失败: {:?}", temp_path))?;

        // 原子重命名
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("重命名进度文件失败: {:?}", path))?;

        debug!(
            "已保存进度: key={}, 已完成分片={}",
            key,
            record.completed_count()
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("已删除进度文件: {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除进度文件失败: {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_record() -> ProgressRecord {
        let mut record = ProgressRecord::new(4096, Utc::now());
        record.uploaded_chunk_indices.extend([0, 1, 2]);
        record
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryProgressStore::new();
        assert!(store.get("missing").await.unwrap().is_none());

        let record = sample_record();
        store.set("k", &record).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(record));
        assert_eq!(store.len(), 1);

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let record = sample_record();

        JsonFileProgressStore::new(dir.path())
            .set("resumable-upload:videos/a.mp4", &record)
            .await
            .unwrap();

        // 新实例读取（模拟进程重启）
        let store = JsonFileProgressStore::new(dir.path());
        let loaded = store.get("resumable-upload:videos/a.mp4").await.unwrap();
        assert_eq!(loaded, Some(record));

        // 文件名不包含原始键中的路径分隔符
        let path = store.path_for("resumable-upload:videos/a.mp4");
        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileProgressStore::new(dir.path().join("nested"));

        assert!(store.get("never-seen").await.unwrap().is_none());
        store.remove("never-seen").await.unwrap();

        store.set("k", &sample_record()).await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_corrupted_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileProgressStore::new(dir.path());
        std::fs::write(store.path_for("k"), b"{not json").unwrap();

        assert!(store.get("k").await.unwrap().is_none());
    }
}

// 本地目录存储客户端
//
// 把目标路径映射到根目录下的文件，用于演示程序和集成测试：
// - 区间写入：预分配文件长度后按偏移写入
// - 暂存-提交：block 写入 `.blocks/{sha256(dest)}/` 暂存目录，提交时按顺序拼接

use super::backend::{BlockCommitClient, RangeWriteClient};
use crate::uploader::credential::AccessToken;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// 暂存目录名
const STAGING_DIR: &str = ".blocks";

/// 把目标路径解析到根目录下，拒绝绝对路径和 `..`
fn resolve_under(root: &Path, dest: &str) -> Result<PathBuf> {
    let relative = Path::new(dest.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    let mut has_file = false;

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                has_file = true;
            }
            Component::CurDir => {}
            _ => bail!("目标路径不合法: {}", dest),
        }
    }

    if !has_file {
        bail!("目标路径为空: {:?}", dest);
    }
    Ok(path)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建目录失败: {:?}", parent))?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("删除文件失败: {:?}", path)),
    }
}

/// 本地区间写入客户端
#[derive(Debug, Clone)]
pub struct LocalRangeWriteClient {
    root: PathBuf,
}

impl LocalRangeWriteClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, dest: &str) -> Result<PathBuf> {
        resolve_under(&self.root, dest)
    }
}

#[async_trait]
impl RangeWriteClient for LocalRangeWriteClient {
    async fn preallocate(&self, dest: &str, size: u64, _token: &AccessToken) -> Result<()> {
        let path = self.path_for(dest)?;
        ensure_parent(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| format!("创建目标文件失败: {:?}", path))?;
        file.set_len(size)
            .await
            .with_context(|| format!("预分配文件失败: {:?}", path))?;

        debug!("已预分配: {:?} ({} bytes)", path, size);
        Ok(())
    }

    async fn write_range(
        &self,
        dest: &str,
        offset: u64,
        data: &[u8],
        _token: &AccessToken,
    ) -> Result<()> {
        let path = self.path_for(dest)?;
        ensure_parent(&path).await?;

        // 不截断：并发写入不同区间
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("打开目标文件失败: {:?}", path))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data)
            .await
            .with_context(|| format!("写入区间失败: {:?} @{}", path, offset))?;
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, dest: &str, _token: &AccessToken) -> Result<()> {
        remove_if_exists(&self.path_for(dest)?).await
    }
}

/// 本地暂存-提交客户端
#[derive(Debug, Clone)]
pub struct LocalBlockCommitClient {
    root: PathBuf,
}

impl LocalBlockCommitClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, dest: &str) -> Result<PathBuf> {
        resolve_under(&self.root, dest)
    }

    /// 目标对象的暂存目录
    pub fn staging_dir(&self, dest: &str) -> PathBuf {
        let digest = Sha256::digest(dest.as_bytes());
        self.root.join(STAGING_DIR).join(hex::encode(digest))
    }

    fn block_path(&self, dest: &str, block_id: &str) -> PathBuf {
        // base64 标准字母表可能包含 '/'
        self.staging_dir(dest).join(block_id.replace('/', "_"))
    }
}

#[async_trait]
impl BlockCommitClient for LocalBlockCommitClient {
    async fn stage_block(
        &self,
        dest: &str,
        block_id: &str,
        data: &[u8],
        _token: &AccessToken,
    ) -> Result<()> {
        let staging = self.staging_dir(dest);
        fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("创建暂存目录失败: {:?}", staging))?;

        let path = self.block_path(dest, block_id);
        fs::write(&path, data)
            .await
            .with_context(|| format!("写入 block 失败: {:?}", path))?;
        Ok(())
    }

    async fn commit_block_list(
        &self,
        dest: &str,
        block_ids: &[String],
        _token: &AccessToken,
    ) -> Result<()> {
        let path = self.path_for(dest)?;
        ensure_parent(&path).await?;

        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("创建目标文件失败: {:?}", path))?;

        for block_id in block_ids {
            let block_path = self.block_path(dest, block_id);
            let data = fs::read(&block_path)
                .await
                .with_context(|| format!("block 未暂存: {} ({:?})", block_id, block_path))?;
            file.write_all(&data).await?;
        }
        file.flush().await?;

        let staging = self.staging_dir(dest);
        if let Err(e) = fs::remove_dir_all(&staging).await {
            debug!("清理暂存目录失败: {:?}, 错误: {}", staging, e);
        }

        debug!("已提交 {} 个 block: {:?}", block_ids.len(), path);
        Ok(())
    }

    async fn delete(&self, dest: &str, _token: &AccessToken) -> Result<()> {
        let staging = self.staging_dir(dest);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("删除暂存目录失败: {:?}", staging));
            }
        }
        remove_if_exists(&self.path_for(dest)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn token() -> AccessToken {
        AccessToken::new("local")
    }

    #[test]
    fn test_resolve_under_rejects_escape() {
        let root = Path::new("/data");
        assert_eq!(
            resolve_under(root, "a/b.bin").unwrap(),
            PathBuf::from("/data/a/b.bin")
        );
        assert_eq!(
            resolve_under(root, "/a/b.bin").unwrap(),
            PathBuf::from("/data/a/b.bin")
        );
        assert!(resolve_under(root, "../etc/passwd").is_err());
        assert!(resolve_under(root, "").is_err());
    }

    #[tokio::test]
    async fn test_range_write_out_of_order() {
        let dir = TempDir::new().unwrap();
        let client = LocalRangeWriteClient::new(dir.path());

        client.preallocate("out/f.bin", 6, &token()).await.unwrap();
        client.write_range("out/f.bin", 3, b"def", &token()).await.unwrap();
        client.write_range("out/f.bin", 0, b"abc", &token()).await.unwrap();

        let content = std::fs::read(dir.path().join("out/f.bin")).unwrap();
        assert_eq!(content, b"abcdef");

        client.delete("out/f.bin", &token()).await.unwrap();
        assert!(!dir.path().join("out/f.bin").exists());
        // 删除不存在的对象也成功
        client.delete("out/f.bin", &token()).await.unwrap();
    }

    #[tokio::test]
    async fn test_block_commit_uses_list_order() {
        let dir = TempDir::new().unwrap();
        let client = LocalBlockCommitClient::new(dir.path());

        client.stage_block("f.bin", "B", b"world", &token()).await.unwrap();
        client.stage_block("f.bin", "A", b"hello ", &token()).await.unwrap();
        client
            .commit_block_list("f.bin", &["A".to_string(), "B".to_string()], &token())
            .await
            .unwrap();

        let content = std::fs::read(dir.path().join("f.bin")).unwrap();
        assert_eq!(content, b"hello world");
        assert!(!client.staging_dir("f.bin").exists());
    }

    #[tokio::test]
    async fn test_block_commit_missing_block_fails() {
        let dir = TempDir::new().unwrap();
        let client = LocalBlockCommitClient::new(dir.path());

        client.stage_block("f.bin", "A", b"x", &token()).await.unwrap();
        let result = client
            .commit_block_list("f.bin", &["A".to_string(), "B".to_string()], &token())
            .await;
        assert!(result.is_err());

        client.delete("f.bin", &token()).await.unwrap();
        assert!(!client.staging_dir("f.bin").exists());
        assert!(!dir.path().join("f.bin").exists());
    }
}

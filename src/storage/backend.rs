// 存储后端能力接口
//
// 两种后端：
// - 区间写入（range write）：先预分配目标对象，再按偏移写入每个分片，无需最终提交
// - 暂存-提交（block commit）：每个分片作为一个 block 暂存，最后按分片顺序提交 block 列表
//
// 调度器只依赖 `StorageBackend`，不按类型分支

use super::retry::RetryPolicy;
use crate::error::{UploadError, UploadResult};
use crate::uploader::chunk::{Chunk, ChunkPlan};
use crate::uploader::credential::AccessToken;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// 存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVariant {
    /// 区间写入
    RangeWrite,
    /// 暂存-提交
    BlockCommit,
}

impl FromStr for StorageVariant {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "range_write" => Ok(Self::RangeWrite),
            "block_commit" => Ok(Self::BlockCommit),
            other => Err(UploadError::InvalidBackendConfiguration(format!(
                "未知的存储类型: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RangeWrite => write!(f, "range_write"),
            Self::BlockCommit => write!(f, "block_commit"),
        }
    }
}

/// 区间写入客户端（外部协作者）
#[async_trait]
pub trait RangeWriteClient: Send + Sync {
    async fn preallocate(&self, dest: &str, size: u64, token: &AccessToken) -> Result<()>;

    async fn write_range(
        &self,
        dest: &str,
        offset: u64,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()>;

    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()>;
}

/// 暂存-提交客户端（外部协作者）
#[async_trait]
pub trait BlockCommitClient: Send + Sync {
    async fn stage_block(
        &self,
        dest: &str,
        block_id: &str,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()>;

    async fn commit_block_list(
        &self,
        dest: &str,
        block_ids: &[String],
        token: &AccessToken,
    ) -> Result<()>;

    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()>;
}

/// 存储后端能力接口
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn variant(&self) -> StorageVariant;

    /// 上传开始前的准备（区间写入后端预分配目标对象）
    ///
    /// `resuming` 为 true 表示存在已完成的分片，不能覆盖已写入的数据
    async fn prepare(
        &self,
        dest: &str,
        file_size: u64,
        resuming: bool,
        token: &AccessToken,
    ) -> Result<()>;

    /// 传输单个分片（带重试）
    async fn transfer_chunk(
        &self,
        dest: &str,
        chunk: &Chunk,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()>;

    /// 所有分片完成后的收尾
    async fn finalize(&self, dest: &str, plan: &ChunkPlan, token: &AccessToken) -> Result<()>;

    /// 删除目标对象（失败 / 取消时的清理）
    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()>;
}

/// 区间写入后端
pub struct RangeWriteBackend<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: RangeWriteClient> RangeWriteBackend<C> {
    pub fn new(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: RangeWriteClient> StorageBackend for RangeWriteBackend<C> {
    fn variant(&self) -> StorageVariant {
        StorageVariant::RangeWrite
    }

    async fn prepare(
        &self,
        dest: &str,
        file_size: u64,
        resuming: bool,
        token: &AccessToken,
    ) -> Result<()> {
        if resuming {
            debug!("断点续传，跳过预分配: {}", dest);
            return Ok(());
        }
        self.client
            .preallocate(dest, file_size, token)
            .await
            .with_context(|| format!("预分配目标对象失败: {} ({} bytes)", dest, file_size))
    }

    async fn transfer_chunk(
        &self,
        dest: &str,
        chunk: &Chunk,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()> {
        let label = format!("[分片#{}] 区间写入 {}", chunk.index, dest);
        self.retry
            .run(&label, |_| self.client.write_range(dest, chunk.offset, data, token))
            .await
    }

    async fn finalize(&self, dest: &str, plan: &ChunkPlan, _token: &AccessToken) -> Result<()> {
        debug!(
            "区间写入后端无需提交: {} ({} 个分片)",
            dest,
            plan.total_chunks()
        );
        Ok(())
    }

    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()> {
        self.client.delete(dest, token).await
    }
}

/// 暂存-提交后端
pub struct BlockCommitBackend<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: BlockCommitClient> BlockCommitBackend<C> {
    pub fn new(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl<C: BlockCommitClient> StorageBackend for BlockCommitBackend<C> {
    fn variant(&self) -> StorageVariant {
        StorageVariant::BlockCommit
    }

    async fn prepare(
        &self,
        _dest: &str,
        _file_size: u64,
        _resuming: bool,
        _token: &AccessToken,
    ) -> Result<()> {
        Ok(())
    }

    async fn transfer_chunk(
        &self,
        dest: &str,
        chunk: &Chunk,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()> {
        let block_id = chunk.block_id();
        let label = format!("[分片#{}] 暂存 block {}", chunk.index, dest);
        self.retry
            .run(&label, |_| self.client.stage_block(dest, &block_id, data, token))
            .await
    }

    async fn finalize(&self, dest: &str, plan: &ChunkPlan, token: &AccessToken) -> Result<()> {
        // block 顺序来自分片计划，而不是完成顺序
        let block_ids = plan.block_ids();
        info!("提交 block 列表: {} ({} 个 block)", dest, block_ids.len());
        self.client
            .commit_block_list(dest, &block_ids, token)
            .await
            .with_context(|| format!("提交 block 列表失败: {}", dest))
    }

    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()> {
        self.client.delete(dest, token).await
    }
}

/// 可用的存储客户端
#[derive(Clone, Default)]
pub struct StorageClients {
    pub range_write: Option<Arc<dyn RangeWriteClient>>,
    pub block_commit: Option<Arc<dyn BlockCommitClient>>,
}

#[async_trait]
impl<T: RangeWriteClient + ?Sized> RangeWriteClient for Arc<T> {
    async fn preallocate(&self, dest: &str, size: u64, token: &AccessToken) -> Result<()> {
        (**self).preallocate(dest, size, token).await
    }

    async fn write_range(
        &self,
        dest: &str,
        offset: u64,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()> {
        (**self).write_range(dest, offset, data, token).await
    }

    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()> {
        (**self).delete(dest, token).await
    }
}

#[async_trait]
impl<T: BlockCommitClient + ?Sized> BlockCommitClient for Arc<T> {
    async fn stage_block(
        &self,
        dest: &str,
        block_id: &str,
        data: &[u8],
        token: &AccessToken,
    ) -> Result<()> {
        (**self).stage_block(dest, block_id, data, token).await
    }

    async fn commit_block_list(
        &self,
        dest: &str,
        block_ids: &[String],
        token: &AccessToken,
    ) -> Result<()> {
        (**self).commit_block_list(dest, block_ids, token).await
    }

    async fn delete(&self, dest: &str, token: &AccessToken) -> Result<()> {
        (**self).delete(dest, token).await
    }
}

/// 根据存储类型选择后端
///
/// 未知类型或缺少对应客户端时返回 `InvalidBackendConfiguration`
pub fn select_backend(
    variant: &str,
    clients: StorageClients,
    retry: RetryPolicy,
) -> UploadResult<Arc<dyn StorageBackend>> {
    let variant: StorageVariant = variant.parse()?;
    match variant {
        StorageVariant::RangeWrite => {
            let client = clients.range_write.ok_or_else(|| {
                UploadError::InvalidBackendConfiguration(
                    "range_write 存储需要提供 RangeWriteClient".to_string(),
                )
            })?;
            Ok(Arc::new(RangeWriteBackend::new(client, retry)))
        }
        StorageVariant::BlockCommit => {
            let client = clients.block_commit.ok_or_else(|| {
                UploadError::InvalidBackendConfiguration(
                    "block_commit 存储需要提供 BlockCommitClient".to_string(),
                )
            })?;
            Ok(Arc::new(BlockCommitBackend::new(client, retry)))
        }
    }
}

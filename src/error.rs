//! 上传错误分类
//!
//! 会话级错误统一使用 `UploadError`，外部协作者（存储、凭证、进度存储）
//! 返回 `anyhow::Error`，在边界处包装为对应的错误变体

use thiserror::Error;

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 分片规划结果与文件大小不一致（配置或程序缺陷，传输前即中止）
    #[error("分片完整性校验失败: {0}")]
    ChunkingIntegrity(String),

    /// 会话被取消
    #[error("上传已取消: {0}")]
    UploadCancelled(String),

    /// 单个分片传输失败
    #[error("分片 #{index} 传输失败 (bytes={offset}+{length}): {source}")]
    ChunkTransfer {
        index: usize,
        offset: u64,
        length: u64,
        #[source]
        source: anyhow::Error,
    },

    /// 凭证签发或续期失败
    #[error("凭证刷新失败: {0}")]
    TokenRefresh(#[source] anyhow::Error),

    /// 未知的存储类型或缺少对应的客户端
    #[error("存储后端配置无效: {0}")]
    InvalidBackendConfiguration(String),

    /// 目标路径解析失败
    #[error("目标路径解析失败: {0}")]
    DestinationResolve(#[source] anyhow::Error),

    /// 进度存储读写失败
    #[error("进度存储失败: {0}")]
    Progress(#[source] anyhow::Error),

    /// 预分配 / 提交等存储操作失败
    #[error("存储操作失败: {0}")]
    Storage(#[source] anyhow::Error),

    /// 读取本地文件失败
    #[error("读取本地文件失败: {0}")]
    Io(#[from] std::io::Error),

    /// 配置无效
    #[error("配置无效: {0}")]
    Config(String),
}

impl UploadError {
    /// 是否为取消导致的错误
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::UploadCancelled(_))
    }

    /// 错误类别名称（用于日志和事件）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChunkingIntegrity(_) => "chunking_integrity",
            Self::UploadCancelled(_) => "upload_cancelled",
            Self::ChunkTransfer { .. } => "chunk_transfer",
            Self::TokenRefresh(_) => "token_refresh",
            Self::InvalidBackendConfiguration(_) => "invalid_backend_configuration",
            Self::DestinationResolve(_) => "destination_resolve",
            Self::Progress(_) => "progress_store",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;

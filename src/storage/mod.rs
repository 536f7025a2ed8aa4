//! 存储后端模块
//!
//! - `backend`：`StorageBackend` 能力接口与两种后端（区间写入 / 暂存-提交）
//! - `retry`：分片传输的指数退避重试
//! - `local`：基于本地目录的存储客户端

pub mod backend;
pub mod local;
pub mod retry;

pub use backend::{
    select_backend, BlockCommitBackend, BlockCommitClient, RangeWriteBackend, RangeWriteClient,
    StorageBackend, StorageClients, StorageVariant,
};
pub use local::{LocalBlockCommitClient, LocalRangeWriteClient};
pub use retry::RetryPolicy;

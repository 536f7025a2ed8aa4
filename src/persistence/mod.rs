//! 上传进度持久化模块
//!
//! 每完成一个分片写入一次进度记录，程序重启后据此断点续传：
//! - 记录中的文件大小与当前文件不一致时丢弃（同名不同文件）
//! - 上传完成或取消时删除记录
//! - 上传失败时保留记录，下次重试从已完成的分片继续
//!
//! ## 文件结构（JSON 文件存储）
//!
//! ```text
//! progress/
//! └── {sha256(key)}.progress.json
//! ```

pub mod store;
pub mod types;

use crate::config::{ProgressStoreConfig, ProgressStoreKind};
use std::sync::Arc;

pub use store::{JsonFileProgressStore, MemoryProgressStore, ProgressStore};
pub use types::{progress_key, ProgressRecord, PROGRESS_KEY_PREFIX};

/// 根据配置创建进度存储
pub fn build_progress_store(config: &ProgressStoreConfig) -> Arc<dyn ProgressStore> {
    match config.kind {
        ProgressStoreKind::Memory => Arc::new(MemoryProgressStore::new()),
        ProgressStoreKind::File => Arc::new(JsonFileProgressStore::new(config.dir.clone())),
    }
}

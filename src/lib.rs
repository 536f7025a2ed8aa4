// Resumable Uploader Library
// 断点续传分片上传核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 进度持久化模块
pub mod persistence;

// 存储后端模块
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{LogConfig, ProgressStoreConfig, ProgressStoreKind, RetryConfig, UploaderConfig};
pub use error::{UploadError, UploadResult};
pub use persistence::{JsonFileProgressStore, MemoryProgressStore, ProgressRecord, ProgressStore};
pub use storage::{
    select_backend, BlockCommitClient, LocalBlockCommitClient, LocalRangeWriteClient,
    RangeWriteClient, RetryPolicy, StorageBackend, StorageClients, StorageVariant,
};
pub use uploader::{
    AccessToken, ConcurrencyController, CredentialBroker, DestinationResolver, EventSink,
    PrefixDestinationResolver, SessionState, StaticCredentialBroker, UploadEvent, UploadFile,
    UploadOutcome, Uploader, UploaderDeps,
};

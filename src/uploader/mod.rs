// 上传引擎模块
//
// - chunk：分片规划
// - concurrency：全局自适应并发控制
// - credential：临时凭证签发与续期
// - events：上传事件分发
// - session：单文件上传会话（调度循环与状态机）
// - manager：按文件名登记会话的上传管理器

pub mod chunk;
pub mod concurrency;
pub mod credential;
pub mod events;
pub mod manager;
pub mod session;

pub use chunk::{
    block_id, select_chunk_size, Chunk, ChunkPlan, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE,
};
pub use concurrency::{
    ConcurrencyController, ConcurrencyState, EffectiveConnectionType, NetworkProbe,
    NetworkQuality, TransferPermit,
};
pub use credential::{AccessToken, CredentialBroker, StaticCredentialBroker, TokenKeeper};
pub use events::{EventSink, UploadEvent};
pub use manager::{Uploader, UploaderDeps};
pub use session::{
    DestinationResolver, PrefixDestinationResolver, SessionControl, SessionState, UploadFile,
    UploadOutcome, UploadSession,
};

//! 进度持久化类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 进度记录键的命名空间前缀
pub const PROGRESS_KEY_PREFIX: &str = "resumable-upload:";

/// 生成进度记录键
pub fn progress_key(file_name: &str) -> String {
    format!("{}{}", PROGRESS_KEY_PREFIX, file_name)
}

/// 上传进度记录
///
/// 每完成一个分片写入一次，用于进程重启后断点续传
/// 以 JSON 格式存储
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// 文件大小（恢复时与当前文件比较，不一致则丢弃）
    pub file_size: u64,

    /// 已完成的分片索引
    #[serde(default)]
    pub uploaded_chunk_indices: BTreeSet<usize>,

    /// 会话开始时间
    pub session_start_time: DateTime<Utc>,

    /// 最后写入时间
    pub last_write_time: DateTime<Utc>,
}

impl ProgressRecord {
    /// 创建空的进度记录
    pub fn new(file_size: u64, session_start_time: DateTime<Utc>) -> Self {
        Self {
            file_size,
            uploaded_chunk_indices: BTreeSet::new(),
            session_start_time,
            last_write_time: Utc::now(),
        }
    }

    /// 记录是否属于给定大小的文件
    pub fn matches_size(&self, file_size: u64) -> bool {
        self.file_size == file_size
    }

    /// 已完成分片数
    pub fn completed_count(&self) -> usize {
        self.uploaded_chunk_indices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_key_is_namespaced() {
        assert_eq!(progress_key("a/b.bin"), "resumable-upload:a/b.bin");
    }

    #[test]
    fn test_record_json_shape() {
        let mut record = ProgressRecord::new(1024, Utc::now());
        record.uploaded_chunk_indices.extend([2, 0, 1]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["file_size"], 1024);
        assert_eq!(json["uploaded_chunk_indices"], serde_json::json!([0, 1, 2]));

        let back: ProgressRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
        assert!(back.matches_size(1024));
        assert!(!back.matches_size(1025));
        assert_eq!(back.completed_count(), 3);
    }
}

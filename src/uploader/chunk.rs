// 上传分片规划
//
// 分片大小选择规则：
// - 文件 < max_chunk_size：目标约 10 个分片，分片大小 = max(min_chunk_size, 文件大小 / 10)
// - 其余情况：固定使用 max_chunk_size
//
// 分片按顺序连续切分，最后一个分片截断到剩余字节数

use crate::error::{UploadError, UploadResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeSet;
use tracing::debug;

/// 默认最小分片大小: 1MB
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// 默认最大分片大小: 4MB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 小文件的目标分片数（保证进度 / ETA 的粒度）
const SMALL_FILE_TARGET_CHUNKS: u64 = 10;

/// block id 的十进制补零宽度
const BLOCK_ID_WIDTH: usize = 6;

/// 上传分片
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 起始偏移
    pub offset: u64,
    /// 字节数
    pub length: u64,
}

impl Chunk {
    /// 分片结束位置（不包含）
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// 暂存-提交后端使用的 block id
    pub fn block_id(&self) -> String {
        block_id(self.index)
    }
}

/// 计算分片大小
///
/// # 参数
/// * `file_size` - 文件大小
/// * `min_chunk_size` - 最小分片大小
/// * `max_chunk_size` - 最大分片大小
pub fn select_chunk_size(file_size: u64, min_chunk_size: u64, max_chunk_size: u64) -> u64 {
    if file_size < max_chunk_size {
        min_chunk_size.max(file_size / SMALL_FILE_TARGET_CHUNKS)
    } else {
        max_chunk_size
    }
}

/// 生成 block id：补零到 6 位的十进制索引，再做 base64 编码
///
/// 补零保证字典序与数值序一致
pub fn block_id(index: usize) -> String {
    STANDARD.encode(format!("{:0width$}", index, width = BLOCK_ID_WIDTH))
}

/// 分片计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<Chunk>,
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// 按文件大小与分片大小范围生成分片计划
    ///
    /// 生成后校验：分片长度之和必须等于文件大小，且偏移从 0 开始连续
    pub fn plan(file_size: u64, min_chunk_size: u64, max_chunk_size: u64) -> UploadResult<Self> {
        if min_chunk_size == 0 || min_chunk_size > max_chunk_size {
            return Err(UploadError::ChunkingIntegrity(format!(
                "分片大小范围无效: min={}, max={}",
                min_chunk_size, max_chunk_size
            )));
        }

        let chunk_size = select_chunk_size(file_size, min_chunk_size, max_chunk_size);
        let chunks = Self::split(file_size, chunk_size);

        let plan = Self {
            chunks,
            file_size,
            chunk_size,
        };
        plan.verify()?;

        debug!(
            "生成分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_size,
            chunk_size,
            plan.total_chunks()
        );

        Ok(plan)
    }

    fn split(file_size: u64, chunk_size: u64) -> Vec<Chunk> {
        let mut chunks = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        let mut index = 0;

        while offset < file_size {
            let end = std::cmp::min(offset + chunk_size, file_size);
            chunks.push(Chunk {
                index,
                offset,
                length: end - offset,
            });
            offset = end;
            index += 1;
        }

        chunks
    }

    /// 校验分片完整性
    fn verify(&self) -> UploadResult<()> {
        let mut expected_offset = 0u64;
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != position || chunk.offset != expected_offset || chunk.length == 0 {
                return Err(UploadError::ChunkingIntegrity(format!(
                    "分片 #{} 不连续: offset={}, 期望 offset={}",
                    chunk.index, chunk.offset, expected_offset
                )));
            }
            expected_offset = chunk.end();
        }

        let total: u64 = self.chunks.iter().map(|c| c.length).sum();
        if total != self.file_size {
            return Err(UploadError::ChunkingIntegrity(format!(
                "分片长度之和 {} 与文件大小 {} 不一致",
                total, self.file_size
            )));
        }

        Ok(())
    }

    /// 所有分片
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// 按索引获取分片
    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// 分片数量
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// 文件大小
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// 实际使用的分片大小
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 给定分片集合的字节数之和（忽略越界索引）
    pub fn bytes_for(&self, indices: &BTreeSet<usize>) -> u64 {
        indices
            .iter()
            .filter_map(|i| self.chunks.get(*i))
            .map(|c| c.length)
            .sum()
    }

    /// 按分片顺序排列的 block id 列表（用于最终提交）
    pub fn block_ids(&self) -> Vec<String> {
        self.chunks.iter().map(Chunk::block_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_large_file_uses_max_chunk_size() {
        let plan = ChunkPlan::plan(45_000_000, DEFAULT_MIN_CHUNK_SIZE, 4_194_304).unwrap();
        assert_eq!(plan.chunk_size(), 4_194_304);
        assert_eq!(plan.total_chunks(), 11);
        let last = plan.chunks().last().unwrap();
        assert_eq!(last.length, 3_056_960);
        assert_eq!(last.offset, 10 * 4_194_304);
    }

    #[test]
    fn test_small_file_clamps_to_min_chunk_size() {
        let plan = ChunkPlan::plan(3_000_000, 1_048_576, DEFAULT_MAX_CHUNK_SIZE).unwrap();
        assert_eq!(plan.chunk_size(), 1_048_576);
        let lengths: Vec<u64> = plan.chunks().iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![1_048_576, 1_048_576, 902_848]);
    }

    #[test]
    fn test_small_file_targets_ten_chunks() {
        // 3MB 文件，最小分片 100KB -> 分片大小 300000
        let plan = ChunkPlan::plan(3_000_000, 100_000, DEFAULT_MAX_CHUNK_SIZE).unwrap();
        assert_eq!(plan.chunk_size(), 300_000);
        assert_eq!(plan.total_chunks(), 10);
    }

    #[test]
    fn test_exact_multiple() {
        let plan = ChunkPlan::plan(16, 4, 4).unwrap();
        assert_eq!(plan.total_chunks(), 4);
        assert!(plan.chunks().iter().all(|c| c.length == 4));
    }

    #[test]
    fn test_empty_file() {
        let plan = ChunkPlan::plan(0, 4, 8).unwrap();
        assert_eq!(plan.total_chunks(), 0);
        assert!(plan.block_ids().is_empty());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        assert!(matches!(
            ChunkPlan::plan(100, 0, 8),
            Err(UploadError::ChunkingIntegrity(_))
        ));
        assert!(matches!(
            ChunkPlan::plan(100, 16, 8),
            Err(UploadError::ChunkingIntegrity(_))
        ));
    }

    #[test]
    fn test_block_id_encoding() {
        assert_eq!(block_id(7), STANDARD.encode("000007"));
        assert_eq!(block_id(7), "MDAwMDA3");
        let decoded = STANDARD.decode(block_id(123)).unwrap();
        assert_eq!(decoded, b"000123");
    }

    #[test]
    fn test_block_ids_follow_plan_order() {
        let plan = ChunkPlan::plan(50, 10, 10).unwrap();
        let ids = plan.block_ids();
        assert_eq!(ids.len(), 5);
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids[4], block_id(4));
    }

    #[test]
    fn test_bytes_for() {
        let plan = ChunkPlan::plan(25, 10, 10).unwrap();
        let done: BTreeSet<usize> = [0, 2, 9].into_iter().collect();
        // 分片 2 只有 5 字节，越界索引 9 忽略
        assert_eq!(plan.bytes_for(&done), 15);
    }

    proptest! {
        #[test]
        fn prop_plan_is_contiguous_and_complete(
            file_size in 0u64..50_000_000,
            min in 100_000u64..2_000_000,
            extra in 0u64..8_000_000,
        ) {
            let max = min + extra;
            let plan = ChunkPlan::plan(file_size, min, max).unwrap();
            let total: u64 = plan.chunks().iter().map(|c| c.length).sum();
            prop_assert_eq!(total, file_size);

            let mut offset = 0;
            for (i, chunk) in plan.chunks().iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.offset, offset);
                prop_assert!(chunk.length <= plan.chunk_size());
                offset = chunk.end();
            }
        }
    }
}

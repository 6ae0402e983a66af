// 上传分片管理
//
// 分片规则由上传方式决定：
// - UPOS：5MB，序号从 1 开始
// - Kodo：4MB，序号从 0 开始
// - APP：2MB，序号从 0 开始
// 最后一个分片为余数，可能小于标准大小

use crate::error::{Result, UploadError};
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 单文件允许的最大分片数
pub const MAX_CHUNKS_PER_FILE: u64 = 10_000;

/// 计算整文件 MD5 时的读缓冲
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片在文件中的位置（从 0 开始）
    pub index: usize,
    /// 发送给服务端的序号（0 或 1 起始，取决于上传方式）
    pub seq: u64,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, seq: u64, range: Range<u64>) -> Self {
        Self { index, seq, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 从已打开的文件读取分片数据
    pub async fn read_data(&self, file: &mut File) -> Result<Vec<u8>> {
        file.seek(std::io::SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.seq,
            self.range.start,
            self.range.end.saturating_sub(1),
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 文件分片计划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<UploadChunk>,
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// 按固定分片大小切分文件
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小
    /// * `index_base` - 首个分片的序号（0 或 1）
    pub fn new(total_size: u64, chunk_size: u64, index_base: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::with_capacity(calculate_chunk_count(total_size, chunk_size) as usize);
        let mut offset = 0u64;
        let mut index = 0usize;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(index, index as u64 + index_base, offset..end));
            offset = end;
            index += 1;
        }

        info!(
            "创建分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self {
            chunks,
            total_size,
            chunk_size,
        }
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 标准分片大小
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

/// 计算文件的分片数量
pub fn calculate_chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size.max(1))
}

/// 分片数是否超过上限（超过时需要先切分文件）
pub fn exceeds_chunk_limit(file_size: u64, chunk_size: u64, limit: u64) -> bool {
    calculate_chunk_count(file_size, chunk_size) > limit
}

/// 分片 MD5（十六进制小写）
pub fn chunk_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// 整文件 MD5，在阻塞线程池中计算
pub async fn file_md5(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut ctx = md5::Context::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            ctx.consume(&buffer[..n]);
        }
        Ok(format!("{:x}", ctx.compute()))
    })
    .await
    .map_err(|e| UploadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;

    Ok(digest)
}

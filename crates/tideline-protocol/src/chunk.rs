//! 流分块器（Chunker）
//!
//! 将任意分片到达的字节流切分为完整的记录块（[`Chunk`]）。
//!
//! # 工作方式
//!
//! - 调用方通过 [`Chunker::add`] 追加原始字节
//! - [`Sieve`] 在缓冲区上给出所有候选记录的 `(start, end)` 区间
//! - [`Chunker::get_next_chunk`] 选择起点最早的区间（起点相同取最长），
//!   起点之前的字节视为噪声丢弃
//!
//! 块的偏移量是相对于整个流的绝对偏移，可直接用作文件断点。
//!
//! # 分片无关性
//!
//! 无论字节以何种方式分片到达，只要 sieve 只报告完整记录，产生的块序列
//! 与一次性到达时完全一致。

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use tracing::{trace, warn};

/// 默认缓冲区上限（字节）
///
/// 无匹配且缓冲区超过该上限时，最旧的字节作为噪声丢弃。
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

/// 一条完整记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 记录起点（流内绝对偏移，含）
    pub start_offset: u64,
    /// 记录终点（流内绝对偏移，不含）
    pub end_offset: u64,
    /// 记录字节
    pub payload: Bytes,
}

impl Chunk {
    /// 记录长度
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// 以 UTF-8（有损）解释负载
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// 记录识别函数
///
/// 返回缓冲区中所有完整记录的 `(start, end)` 区间（`end` 不含）。
/// 不完整的记录不得报告。
pub trait Sieve: Send {
    fn sieve(&self, buf: &[u8]) -> Vec<(usize, usize)>;
}

impl<F> Sieve for F
where
    F: Fn(&[u8]) -> Vec<(usize, usize)> + Send,
{
    fn sieve(&self, buf: &[u8]) -> Vec<(usize, usize)> {
        self(buf)
    }
}

/// 以换行结尾的行记录
pub fn line_sieve(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, byte) in buf.iter().enumerate() {
        if *byte == b'\n' {
            spans.push((start, i + 1));
            start = i + 1;
        }
    }
    spans
}

/// 基于正则的 sieve，报告所有非重叠匹配
#[derive(Debug, Clone)]
pub struct RegexSieve {
    regex: Regex,
}

impl RegexSieve {
    pub fn new(regex: Regex) -> Self {
        Self { regex }
    }

    pub fn spans<'a>(&'a self, buf: &'a [u8]) -> impl Iterator<Item = (usize, usize)> + 'a {
        self.regex.find_iter(buf).map(|m| (m.start(), m.end()))
    }
}

impl Sieve for RegexSieve {
    fn sieve(&self, buf: &[u8]) -> Vec<(usize, usize)> {
        self.spans(buf).collect()
    }
}

/// 流分块器
pub struct Chunker {
    sieve: Box<dyn Sieve>,
    buffer: BytesMut,
    /// `buffer[0]` 在流中的绝对偏移
    base_offset: u64,
    max_buffered: usize,
    noise_discarded: u64,
}

impl Chunker {
    /// 从流起点开始分块
    pub fn new(sieve: impl Sieve + 'static) -> Self {
        Self::with_base_offset(sieve, 0)
    }

    /// 从流内某个绝对偏移开始分块（用于文件断点续读）
    pub fn with_base_offset(sieve: impl Sieve + 'static, base_offset: u64) -> Self {
        Self {
            sieve: Box::new(sieve),
            buffer: BytesMut::with_capacity(4096),
            base_offset,
            max_buffered: DEFAULT_MAX_BUFFERED,
            noise_discarded: 0,
        }
    }

    /// 设置缓冲区上限
    pub fn max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered.max(1);
        self
    }

    /// 追加原始字节
    pub fn add(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// 取出下一条完整记录
    ///
    /// 没有完整记录时返回 `None`，并在缓冲区超限时丢弃最旧的字节。
    pub fn get_next_chunk(&mut self) -> Option<Chunk> {
        let len = self.buffer.len();
        let selected = self
            .sieve
            .sieve(&self.buffer)
            .into_iter()
            .filter(|&(start, end)| start < end && end <= len)
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let Some((start, end)) = selected else {
            self.enforce_bound();
            return None;
        };

        if start > 0 {
            trace!("Chunker discarding {} noise bytes", start);
            self.discard_front(start);
        }

        let length = end - start;
        let start_offset = self.base_offset;
        let payload = self.buffer.split_to(length).freeze();
        self.base_offset += length as u64;

        Some(Chunk {
            start_offset,
            end_offset: self.base_offset,
            payload,
        })
    }

    /// 缓冲中尚未成块的字节数
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 下一个尚未消费字节的绝对偏移
    pub fn offset(&self) -> u64 {
        self.base_offset
    }

    /// 累计丢弃的噪声字节数
    pub fn noise_discarded(&self) -> u64 {
        self.noise_discarded
    }

    /// 丢弃所有缓冲数据（偏移前移）
    pub fn clear(&mut self) {
        let len = self.buffer.len();
        self.discard_front(len);
    }

    fn discard_front(&mut self, count: usize) {
        let _ = self.buffer.split_to(count);
        self.base_offset += count as u64;
        self.noise_discarded += count as u64;
    }

    fn enforce_bound(&mut self) {
        let len = self.buffer.len();
        if len > self.max_buffered {
            let excess = len - self.max_buffered;
            warn!(
                "Chunker buffer exceeded {} bytes without a record, dropping {} bytes",
                self.max_buffered, excess
            );
            self.discard_front(excess);
        }
    }
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("buffered", &self.buffer.len())
            .field("base_offset", &self.base_offset)
            .field("max_buffered", &self.max_buffered)
            .field("noise_discarded", &self.noise_discarded)
            .finish()
    }
}

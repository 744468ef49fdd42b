//! 可续读的行记录解析器
//!
//! 在 [`Chunker`] + [`line_sieve`] 之上按行切分文件内容，
//! 每条记录交给 [`RecordParser`] 解码。位置只在整行结束处前移。

use crate::error::DatasetError;
use crate::state::ParserState;
use std::sync::Arc;
use tideline_protocol::{Chunker, DataParticle, DecodeError, line_sieve};
use tracing::{debug, trace};

/// 单行记录解码
pub trait RecordParser: Send {
    /// 解码一行（含行尾）；非数据行返回 `Err`
    fn parse_record(&mut self, line: &[u8]) -> Result<DataParticle, DecodeError>;
}

/// 为每个文件创建新的解析器
pub type ParserFactory =
    Arc<dyn Fn() -> Result<Box<dyn RecordParser>, DatasetError> + Send + Sync>;

#[derive(Debug)]
pub enum ParseEvent {
    /// 一条粒子及其之后的解析位置
    Record(DataParticle, ParserState),
    /// 跳过了一行非数据内容
    Skipped(ParserState),
}

impl ParseEvent {
    pub fn state(&self) -> &ParserState {
        match self {
            Self::Record(_, state) | Self::Skipped(state) => state,
        }
    }
}

pub struct ResumableParser {
    chunker: Chunker,
    parser: Box<dyn RecordParser>,
    state: ParserState,
    resync: bool,
}

impl ResumableParser {
    /// 从 `state.position` 开始解析
    ///
    /// `mid_line` 表示起点前一个字节不是换行，需要先丢弃到下一个换行。
    pub fn new(parser: Box<dyn RecordParser>, state: ParserState, mid_line: bool) -> Self {
        Self {
            chunker: Chunker::with_base_offset(line_sieve, state.position),
            parser,
            state,
            resync: mid_line,
        }
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    /// 未成行的缓冲字节数
    pub fn pending(&self) -> usize {
        self.chunker.buffered_len()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.chunker.add(data);
    }

    pub fn next_event(&mut self) -> Option<ParseEvent> {
        let chunk = self.chunker.get_next_chunk()?;
        self.state.position = chunk.end_offset;

        if self.resync {
            self.resync = false;
            debug!(
                "Discarded {} bytes of partial record before offset {}",
                chunk.len(),
                chunk.end_offset
            );
            return Some(ParseEvent::Skipped(self.state.clone()));
        }

        match self.parser.parse_record(&chunk.payload) {
            Ok(particle) => {
                self.state.timestamp = Some(particle.timestamp());
                Some(ParseEvent::Record(particle, self.state.clone()))
            },
            Err(e) => {
                trace!("Skipping line at {}: {}", chunk.start_offset, e);
                Some(ParseEvent::Skipped(self.state.clone()))
            },
        }
    }
}

impl std::fmt::Debug for ResumableParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableParser")
            .field("chunker", &self.chunker)
            .field("state", &self.state)
            .field("resync", &self.resync)
            .finish()
    }
}

//! 目录扫描与文件一致性检查

use crate::config::HarvesterConfig;
use crate::error::DatasetError;
use std::cmp::Ordering;
use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// 文件排序键：文件名中的数字段，数字相同时按文件名
///
/// `20130104.flort.log` => `[20130104]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    numbers: Vec<u64>,
    name: String,
}

impl SortKey {
    pub fn of(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut numbers = Vec::new();
        let mut current: Option<u64> = None;
        for c in name.chars() {
            match c.to_digit(10) {
                Some(d) => {
                    let n = current.unwrap_or(0);
                    current = Some(n.saturating_mul(10).saturating_add(u64::from(d)));
                },
                None => {
                    if let Some(n) = current.take() {
                        numbers.push(n);
                    }
                },
            }
        }
        if let Some(n) = current {
            numbers.push(n);
        }
        Self { numbers, name }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numbers
            .cmp(&other.numbers)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 扫描目录中匹配的文件，按 [`SortKey`] 升序
pub struct FileHarvester {
    config: HarvesterConfig,
    pattern: String,
}

impl FileHarvester {
    pub fn new(config: HarvesterConfig) -> Result<Self, DatasetError> {
        let pattern = config.glob_pattern();
        glob::Pattern::new(&pattern)?;
        Ok(Self { config, pattern })
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn scan(&self) -> Result<Vec<PathBuf>, DatasetError> {
        let mut files = Vec::new();
        for entry in glob::glob(&self.pattern)? {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {},
                Err(e) => warn!("Skipping unreadable entry: {}", e),
            }
        }
        files.sort_by_cached_key(|p| SortKey::of(p));
        trace!("Scan of {} found {} files", self.pattern, files.len());
        Ok(files)
    }

    /// 排在 `after` 之后的第一个文件；`after` 为空时返回第一个文件
    pub fn next_after(
        &self,
        after: Option<&Path>,
        skip: impl Fn(&Path) -> bool,
    ) -> Result<Option<PathBuf>, DatasetError> {
        let floor = after.map(SortKey::of);
        Ok(self.scan()?.into_iter().find(|p| {
            floor.as_ref().is_none_or(|k| SortKey::of(p) > *k) && !skip(p)
        }))
    }
}

/// 已读区域末尾保留的字节数
const TAIL_LEN: usize = 64;

/// 打开时记录的文件身份，用于发现替换、截断和原地重写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    inode: Option<u64>,
    /// 上次检查时的文件长度
    len: u64,
    /// 已读区域末尾的字节
    tail: Vec<u8>,
}

impl FileIdentity {
    pub fn of(metadata: &Metadata) -> Self {
        Self {
            inode: inode(metadata),
            len: metadata.len(),
            tail: Vec::new(),
        }
    }

    /// 记录刚读到的数据
    pub fn record_read(&mut self, data: &[u8]) {
        self.tail.extend_from_slice(data);
        if self.tail.len() > TAIL_LEN {
            let excess = self.tail.len() - TAIL_LEN;
            self.tail.drain(..excess);
        }
    }

    /// 检查路径上的文件仍是同一个文件，且 `read_offset` 之前的内容未变
    ///
    /// 文件比上次检查时短，或已读区域末尾的字节不同，都视为被改写。
    pub fn verify(&mut self, path: &Path, read_offset: u64) -> Result<(), DatasetError> {
        let inconsistent = |reason: String| DatasetError::FileConsistency {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = std::fs::metadata(path)
            .map_err(|e| inconsistent(format!("file is no longer readable: {}", e)))?;
        let current = inode(&metadata);
        if self.inode.is_some() && current != self.inode {
            return Err(inconsistent("file was replaced".into()));
        }
        let len = metadata.len();
        if len < read_offset {
            return Err(inconsistent(format!(
                "file shrank to {} bytes, already read {}",
                len, read_offset
            )));
        }
        if len < self.len {
            return Err(inconsistent(format!(
                "file shrank from {} to {} bytes",
                self.len, len
            )));
        }

        if !self.tail.is_empty() {
            let mut actual = vec![0u8; self.tail.len()];
            read_at(path, read_offset - self.tail.len() as u64, &mut actual)
                .map_err(|e| inconsistent(format!("file is no longer readable: {}", e)))?;
            if actual != self.tail {
                return Err(inconsistent(format!(
                    "file was rewritten before offset {}",
                    read_offset
                )));
            }
        }
        self.len = len;
        Ok(())
    }
}

fn read_at(path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(unix)]
fn inode(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode(_metadata: &Metadata) -> Option<u64> {
    None
}

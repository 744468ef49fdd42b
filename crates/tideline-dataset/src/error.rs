//! 数据集驱动错误类型

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    /// 正在读取的文件被截断或替换
    #[error("File consistency error in {}: {reason}", .path.display())]
    FileConsistency { path: PathBuf, reason: String },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Invalid record pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// 状态文件无法解析或写入
    #[error("Invalid driver state: {0}")]
    State(#[from] serde_json::Error),

    /// 状态文件已被其他进程持有
    #[error("State file {} is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("Sampling already running")]
    AlreadyRunning,
}

//! 断点状态文件
//!
//! 状态以 JSON 保存；写入先落到临时文件再原子重命名，
//! 同时持有 `<path>.lock` 的排他锁，保证同一状态文件只有一个采集进程。

use crate::error::DatasetError;
use crate::state::DriverState;
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct JsonStateStore {
    path: PathBuf,
    // 锁随文件句柄释放
    _lock: File,
}

impl JsonStateStore {
    /// 打开状态文件并获取排他锁
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let lock_path = sibling(&path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if !lock.try_lock_exclusive()? {
            return Err(DatasetError::Locked(path));
        }

        debug!("Opened state store {}", path.display());
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取上次保存的状态；文件不存在时返回 `None`
    pub fn load(&self) -> Result<Option<DriverState>, DatasetError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            warn!("State file {} is empty, starting fresh", self.path.display());
            return Ok(None);
        }
        Ok(Some(DriverState::from_json(&text)?))
    }

    pub fn save(&self, state: &DriverState) -> Result<(), DatasetError> {
        let tmp_path = sibling(&self.path, "tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(state.to_json()?.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

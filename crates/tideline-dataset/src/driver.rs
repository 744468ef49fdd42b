//! 数据集驱动
//!
//! 一个采集线程按排序键依次读取目录中的日志文件，把每行记录解码成粒子交给宿主，
//! 并维护可持久化的断点（[`DriverState`]）。重启时从断点继续，不重复也不遗漏。

use crate::config::DatasetConfig;
use crate::error::DatasetError;
use crate::harvester::{FileHarvester, FileIdentity};
use crate::hooks::DatasetEventHandler;
use crate::parser::{ParseEvent, ParserFactory, ResumableParser};
use crate::state::{DriverState, HarvesterState, ParserState};
use crate::store::JsonStateStore;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8192;

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct DatasetDriver {
    config: DatasetConfig,
    factory: ParserFactory,
    handler: Arc<dyn DatasetEventHandler>,
    state: Arc<Mutex<DriverState>>,
    rate: Arc<Mutex<Option<f64>>>,
    store: Option<Arc<JsonStateStore>>,
    worker: Option<Worker>,
}

impl DatasetDriver {
    /// 创建驱动；`memento` 为上次保存的断点
    pub fn new(
        config: DatasetConfig,
        memento: Option<DriverState>,
        parser_factory: ParserFactory,
        handler: Arc<dyn DatasetEventHandler>,
    ) -> Result<Self, DatasetError> {
        config.validate()?;
        let rate = config.records_per_second;
        Ok(Self {
            config,
            factory: parser_factory,
            handler,
            state: Arc::new(Mutex::new(memento.unwrap_or_default())),
            rate: Arc::new(Mutex::new(rate)),
            store: None,
            worker: None,
        })
    }

    /// 每次断点前移后写入状态文件
    pub fn with_store(mut self, store: JsonStateStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn start_sampling(&mut self) -> Result<(), DatasetError> {
        if self.is_sampling() {
            return Err(DatasetError::AlreadyRunning);
        }
        // 上一次线程可能已自行退出
        self.join_worker();

        let harvester = FileHarvester::new(self.config.harvester.clone())?;
        let (stop_tx, stop_rx) = bounded(1);
        let memento = self.state.lock().clone();
        let harvest = Harvest {
            harvester,
            factory: self.factory.clone(),
            handler: self.handler.clone(),
            state: self.state.clone(),
            rate: self.rate.clone(),
            store: self.store.clone(),
            stop_rx,
            cursor: memento.harvester.as_ref().map(|h| h.file_path.clone()),
            resume: memento.harvester.as_ref().map(|h| {
                let parser = memento.parser.clone().unwrap_or(ParserState {
                    position: h.byte_offset,
                    timestamp: None,
                });
                (h.file_path.clone(), parser)
            }),
            failed: HashSet::new(),
            buf: vec![0; READ_CHUNK],
        };

        let handle = std::thread::Builder::new()
            .name("tideline-harvest".into())
            .spawn(move || harvest.run())?;
        info!("Harvesting {}", self.config.harvester.glob_pattern());
        self.worker = Some(Worker { stop_tx, handle });
        Ok(())
    }

    /// 停止采集并返回最终断点
    pub fn stop_sampling(&mut self) -> DriverState {
        if let Some(worker) = &self.worker {
            let _ = worker.stop_tx.try_send(());
        }
        self.join_worker();
        self.state()
    }

    pub fn is_sampling(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    pub fn state(&self) -> DriverState {
        self.state.lock().clone()
    }

    /// 修改发布速率上限，运行中立即生效
    pub fn set_records_per_second(&self, rate: Option<f64>) -> Result<(), DatasetError> {
        if let Some(r) = rate
            && !(r.is_finite() && r > 0.0)
        {
            return Err(DatasetError::Config("records_per_second must be positive".into()));
        }
        *self.rate.lock() = rate;
        Ok(())
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker.stop_tx);
            if worker.handle.join().is_err() {
                error!("Harvest thread panicked");
            }
        }
    }
}

impl Drop for DatasetDriver {
    fn drop(&mut self) {
        self.join_worker();
    }
}

struct ActiveFile {
    path: PathBuf,
    file: File,
    identity: FileIdentity,
    read_offset: u64,
    parser: ResumableParser,
}

enum Step {
    /// 读到了新数据
    Progress,
    /// 暂无新数据
    Idle,
    /// 已转向更新的文件
    Finished,
    Stop,
}

struct Harvest {
    harvester: FileHarvester,
    factory: ParserFactory,
    handler: Arc<dyn DatasetEventHandler>,
    state: Arc<Mutex<DriverState>>,
    rate: Arc<Mutex<Option<f64>>>,
    store: Option<Arc<JsonStateStore>>,
    stop_rx: Receiver<()>,
    /// 最近打开过的文件，下一个文件从它之后选
    cursor: Option<PathBuf>,
    resume: Option<(PathBuf, ParserState)>,
    failed: HashSet<PathBuf>,
    buf: Vec<u8>,
}

impl Harvest {
    fn run(mut self) {
        let poll = self.harvester.config().poll_interval();
        let mut active: Option<ActiveFile> = None;

        loop {
            if self.stop_requested() {
                break;
            }

            if active.is_none() {
                match self.select() {
                    Ok(Some(file)) => active = Some(file),
                    Ok(None) => {
                        if self.wait(poll) {
                            break;
                        }
                        continue;
                    },
                    Err(e) => {
                        warn!("Directory scan failed: {}", e);
                        self.handler.on_exception(&e);
                        if self.wait(poll) {
                            break;
                        }
                        continue;
                    },
                }
            }

            let Some(current) = active.as_mut() else {
                continue;
            };
            match self.step(current) {
                Ok(Step::Progress) => {},
                Ok(Step::Idle) => {
                    if self.wait(poll) {
                        break;
                    }
                },
                Ok(Step::Finished) => active = None,
                Ok(Step::Stop) => break,
                Err(e) => {
                    let path = current.path.clone();
                    active = None;
                    self.fail(path, e);
                },
            }
        }
        debug!("Harvest loop exited");
    }

    /// 选出下一个要读取的文件
    fn select(&mut self) -> Result<Option<ActiveFile>, DatasetError> {
        let mut candidate = self.resume.take().filter(|(path, _)| {
            let exists = path.is_file();
            if !exists {
                debug!("Resume file {} no longer exists", path.display());
            }
            exists
        });

        loop {
            let (path, parser_state) = match candidate.take() {
                Some(c) => c,
                None => {
                    let failed = &self.failed;
                    let next = self
                        .harvester
                        .next_after(self.cursor.as_deref(), |p| failed.contains(p))?;
                    match next {
                        Some(path) => (
                            path,
                            ParserState {
                                position: 0,
                                timestamp: None,
                            },
                        ),
                        None => return Ok(None),
                    }
                },
            };

            self.cursor = Some(path.clone());
            match self.open(&path, parser_state) {
                Ok(active) => return Ok(Some(active)),
                Err(e) => self.fail(path, e),
            }
        }
    }

    fn open(&self, path: &Path, parser_state: ParserState) -> Result<ActiveFile, DatasetError> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        let offset = parser_state.position;
        if metadata.len() < offset {
            return Err(DatasetError::FileConsistency {
                path: path.to_path_buf(),
                reason: format!(
                    "file is {} bytes, resume offset is {}",
                    metadata.len(),
                    offset
                ),
            });
        }

        let mid_line = if offset > 0 {
            let mut prev = [0u8; 1];
            file.seek(SeekFrom::Start(offset - 1))?;
            file.read_exact(&mut prev)?;
            prev[0] != b'\n'
        } else {
            false
        };
        file.seek(SeekFrom::Start(offset))?;

        info!("Reading {} from offset {}", path.display(), offset);
        Ok(ActiveFile {
            path: path.to_path_buf(),
            file,
            identity: FileIdentity::of(&metadata),
            read_offset: offset,
            parser: ResumableParser::new((self.factory)()?, parser_state, mid_line),
        })
    }

    fn step(&mut self, current: &mut ActiveFile) -> Result<Step, DatasetError> {
        let n = self.read_more(current)?;
        // 交付之前确认已读部分没有被截断或改写
        current.identity.verify(&current.path, current.read_offset)?;
        if n > 0 {
            return Ok(self.drain(current));
        }

        let failed = &self.failed;
        let newer = self
            .harvester
            .next_after(Some(&current.path), |p| failed.contains(p))?;
        if newer.is_none() {
            return Ok(Step::Idle);
        }
        // 转向新文件前再读一次，避免漏掉刚追加的尾部
        if self.read_more(current)? > 0 {
            current.identity.verify(&current.path, current.read_offset)?;
            return Ok(self.drain(current));
        }
        if current.parser.pending() > 0 {
            warn!(
                "Abandoning {} bytes of incomplete record at end of {}",
                current.parser.pending(),
                current.path.display()
            );
        }
        info!("Finished {}", current.path.display());
        Ok(Step::Finished)
    }

    fn read_more(&mut self, current: &mut ActiveFile) -> Result<usize, DatasetError> {
        let n = current.file.read(&mut self.buf)?;
        if n > 0 {
            current.read_offset += n as u64;
            current.identity.record_read(&self.buf[..n]);
            current.parser.feed(&self.buf[..n]);
        }
        Ok(n)
    }

    /// 交付已成行的记录：先粒子回调，再前移断点并回调状态
    fn drain(&mut self, current: &mut ActiveFile) -> Step {
        while let Some(event) = current.parser.next_event() {
            let (particle, parser_state) = match event {
                ParseEvent::Record(particle, state) => (Some(particle), state),
                ParseEvent::Skipped(state) => (None, state),
            };
            if let Some(particle) = &particle {
                self.handler.on_particle(particle);
            }

            let snapshot = {
                let mut state = self.state.lock();
                state.harvester = Some(HarvesterState {
                    file_path: current.path.clone(),
                    byte_offset: parser_state.position,
                });
                state.parser = Some(parser_state);
                state.clone()
            };
            self.handler.on_state(&snapshot);
            self.persist(&snapshot);

            let rate = *self.rate.lock();
            let stop = match (rate, particle.is_some()) {
                (Some(r), true) => self.wait(Duration::from_secs_f64(1.0 / r)),
                _ => self.stop_requested(),
            };
            if stop {
                return Step::Stop;
            }
        }
        Step::Progress
    }

    fn persist(&self, state: &DriverState) {
        if let Some(store) = &self.store
            && let Err(e) = store.save(state)
        {
            error!("Failed to save state to {}: {}", store.path().display(), e);
            self.handler.on_exception(&e);
        }
    }

    fn fail(&mut self, path: PathBuf, e: DatasetError) {
        error!("Giving up on {}: {}", path.display(), e);
        self.failed.insert(path);
        self.handler.on_exception(&e);
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// 可被停止信号打断的等待；返回 true 表示应停止
    fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.stop_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarvesterConfig;
    use crate::flort::FlortParser;
    use crate::hooks::{ChannelDatasetHandler, DatasetEvent};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::time::Instant;

    const RECORD: &str =
        "2013/01/01 00:00:04.520 01/01/13\t00:00:02\t700\t4130\t695\t700\t460\t4130\t547\r\n";

    fn config(dir: &Path) -> DatasetConfig {
        let mut harvester = HarvesterConfig::new(dir, "*.flort.log");
        harvester.frequency = 0.05;
        DatasetConfig::new(harvester)
    }

    fn append(path: &Path, records: usize) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        for _ in 0..records {
            file.write_all(RECORD.as_bytes()).unwrap();
        }
    }

    fn next_event(rx: &Receiver<DatasetEvent>) -> DatasetEvent {
        rx.recv_timeout(Duration::from_secs(5)).expect("no event")
    }

    fn offsets(rx: &Receiver<DatasetEvent>, records: usize) -> Vec<u64> {
        let mut out = Vec::new();
        while out.len() < records {
            assert!(matches!(next_event(rx), DatasetEvent::Particle(_)));
            match next_event(rx) {
                DatasetEvent::State(state) => out.push(state.harvester.unwrap().byte_offset),
                other => panic!("expected state, got {:?}", other),
            }
        }
        out
    }

    #[test]
    fn test_append_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20130101.flort.log");
        append(&path, 2);

        let (handler, rx) = ChannelDatasetHandler::new();
        let mut driver =
            DatasetDriver::new(config(dir.path()), None, FlortParser::factory(), Arc::new(handler))
                .unwrap();
        driver.start_sampling().unwrap();
        assert_eq!(offsets(&rx, 2), vec![73, 146]);

        append(&path, 1);
        assert_eq!(offsets(&rx, 1), vec![219]);

        let state = driver.stop_sampling();
        assert_eq!(state.resume_offset(), 219);
        assert_eq!(state.harvester.unwrap().file_path, path);

        // 重启后没有新数据，不应重复发布
        driver.start_sampling().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        driver.stop_sampling();
    }

    #[test]
    fn test_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _rx) = ChannelDatasetHandler::new();
        let mut driver =
            DatasetDriver::new(config(dir.path()), None, FlortParser::factory(), Arc::new(handler))
                .unwrap();
        driver.start_sampling().unwrap();
        assert!(matches!(driver.start_sampling(), Err(DatasetError::AlreadyRunning)));
        driver.stop_sampling();
        assert!(!driver.is_sampling());
    }

    #[test]
    fn test_noise_lines_advance_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20130101.flort.log");
        fs::write(&path, format!("2013/01/01 00:00:00.000 logger started\r\n{}", RECORD)).unwrap();

        let (handler, rx) = ChannelDatasetHandler::new();
        let mut driver =
            DatasetDriver::new(config(dir.path()), None, FlortParser::factory(), Arc::new(handler))
                .unwrap();
        driver.start_sampling().unwrap();
        assert!(matches!(next_event(&rx), DatasetEvent::State(s) if s.resume_offset() == 40));
        assert!(matches!(next_event(&rx), DatasetEvent::Particle(_)));
        assert!(matches!(next_event(&rx), DatasetEvent::State(s) if s.resume_offset() == 113));
        driver.stop_sampling();
    }

    #[test]
    fn test_throttle_is_interruptible() {
        let dir = tempfile::tempdir().unwrap();
        append(&dir.path().join("20130101.flort.log"), 3);

        let mut config = config(dir.path());
        config.records_per_second = Some(0.1);
        let (handler, rx) = ChannelDatasetHandler::new();
        let mut driver =
            DatasetDriver::new(config, None, FlortParser::factory(), Arc::new(handler)).unwrap();
        driver.start_sampling().unwrap();
        assert_eq!(offsets(&rx, 1), vec![73]);

        let started = Instant::now();
        let state = driver.stop_sampling();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(state.resume_offset(), 73);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rejects_invalid_rate() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _rx) = ChannelDatasetHandler::new();
        let driver =
            DatasetDriver::new(config(dir.path()), None, FlortParser::factory(), Arc::new(handler))
                .unwrap();
        assert!(driver.set_records_per_second(Some(-1.0)).is_err());
        assert!(driver.set_records_per_second(None).is_ok());
    }

    #[test]
    fn test_state_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir(&data).unwrap();
        append(&data.join("20130101.flort.log"), 2);

        let state_path = dir.path().join("state.json");
        let (handler, rx) = ChannelDatasetHandler::new();
        let mut driver =
            DatasetDriver::new(config(&data), None, FlortParser::factory(), Arc::new(handler))
                .unwrap()
                .with_store(JsonStateStore::open(&state_path).unwrap());
        driver.start_sampling().unwrap();
        offsets(&rx, 2);
        let state = driver.stop_sampling();
        drop(driver);

        let store = JsonStateStore::open(&state_path).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }
}

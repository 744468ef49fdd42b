//! FLORT-D 数据集驱动端到端场景

use crossbeam_channel::Receiver;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tideline_dataset::{HarvesterConfig, HarvesterState};
use tideline_sdk::prelude::*;

const RECORD_LEN: u64 = 73;

/// 第 `day` 天的第 `index` 条记录（每条 73 字节，时间戳互不相同）
fn record(day: u32, index: u32) -> String {
    format!(
        "2013/01/{:02} 00:{:02}:{:02}.520 01/{:02}/13\t00:00:02\t700\t4130\t695\t700\t460\t4130\t547\r\n",
        day,
        index / 60,
        index % 60,
        day
    )
}

fn log_path(dir: &Path, day: u32) -> PathBuf {
    dir.join(format!("201301{:02}.flort.log", day))
}

fn write_log(dir: &Path, day: u32, records: u32) -> PathBuf {
    let path = log_path(dir, day);
    let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
    for i in 0..records {
        file.write_all(record(day, i).as_bytes()).unwrap();
    }
    path
}

fn config(dir: &Path) -> DatasetConfig {
    let mut harvester = HarvesterConfig::new(dir, "*.flort.log");
    harvester.frequency = 0.05;
    DatasetConfig::new(harvester)
}

fn driver(
    config: DatasetConfig,
    memento: Option<DriverState>,
) -> (DatasetDriver, Receiver<DatasetEvent>) {
    let (handler, events) = ChannelDatasetHandler::new();
    let driver =
        DatasetDriver::new(config, memento, FlortParser::factory(), Arc::new(handler)).unwrap();
    (driver, events)
}

/// 收集 `count` 个粒子，并确认之后没有多余的粒子
fn particles(events: &Receiver<DatasetEvent>, count: usize) -> Vec<DataParticle> {
    let mut out = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while out.len() < count {
        let left = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for particles");
        if let Ok(DatasetEvent::Particle(p)) = events.recv_timeout(left) {
            out.push(p);
        }
    }
    let quiet_until = Instant::now() + Duration::from_millis(300);
    while let Some(left) = quiet_until.checked_duration_since(Instant::now()) {
        if let Ok(DatasetEvent::Particle(p)) = events.recv_timeout(left) {
            panic!("unexpected extra particle at {}", p.timestamp());
        }
    }
    out
}

fn exception(events: &Receiver<DatasetEvent>) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        if let Ok(DatasetEvent::Exception(message)) = events.recv_timeout(left) {
            return message;
        }
    }
    panic!("no exception reported");
}

#[test]
fn test_harvest_across_files_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (mut driver, events) = driver(config(dir.path()), None);
    driver.start_sampling().unwrap();

    write_log(dir.path(), 1, 2);
    assert_eq!(particles(&events, 2).len(), 2);

    write_log(dir.path(), 2, 4);
    let day2 = particles(&events, 4);
    assert_eq!(day2[0].get("date_string"), Some(&ParticleValue::Text("01/02/13".into())));

    // 序列中的空缺不影响
    write_log(dir.path(), 4, 15);
    assert_eq!(particles(&events, 15).len(), 15);

    let state = driver.stop_sampling();
    assert_eq!(
        state.harvester,
        Some(HarvesterState {
            file_path: log_path(dir.path(), 4),
            byte_offset: 15 * RECORD_LEN,
        })
    );

    driver.start_sampling().unwrap();
    write_log(dir.path(), 5, 2);
    let day5 = particles(&events, 2);
    assert_eq!(day5[0].get("date_string"), Some(&ParticleValue::Text("01/05/13".into())));
    driver.stop_sampling();
}

#[test]
fn test_two_then_one_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_log(dir.path(), 1, 2);
    let (mut driver, events) = driver(config(dir.path()), None);
    driver.start_sampling().unwrap();

    let mut offsets = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while offsets.len() < 2 && Instant::now() < deadline {
        if let Ok(DatasetEvent::State(s)) = events.recv_timeout(Duration::from_millis(100)) {
            offsets.push(s.resume_offset());
        }
    }
    assert_eq!(offsets, vec![73, 146]);

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(record(1, 2).as_bytes()).unwrap();
    loop {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            DatasetEvent::State(s) => {
                assert_eq!(s.resume_offset(), 219);
                break;
            },
            DatasetEvent::Particle(_) => {},
            DatasetEvent::Exception(e) => panic!("{}", e),
        }
    }
    driver.stop_sampling();
}

#[test]
fn test_resume_after_completed_file() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_log(dir.path(), 1, 2);
    write_log(dir.path(), 2, 4);

    let memento = DriverState {
        harvester: Some(HarvesterState {
            file_path: first,
            byte_offset: 2 * RECORD_LEN,
        }),
        parser: None,
    };
    let (mut driver, events) = driver(config(dir.path()), Some(memento));
    driver.start_sampling().unwrap();
    let got = particles(&events, 4);
    let day2 = ParticleValue::Text("01/02/13".into());
    assert!(got.iter().all(|p| p.get("date_string") == Some(&day2)));
    driver.stop_sampling();
}

#[test]
fn test_resume_mid_file() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path(), 1, 2);
    let second = write_log(dir.path(), 2, 4);

    let memento = DriverState::at(&second, 146, Some(3_566_073_601.52));
    let (mut driver, events) = driver(config(dir.path()), Some(memento));
    driver.start_sampling().unwrap();
    let got = particles(&events, 2);
    assert!(got[0].timestamp() < got[1].timestamp());
    assert_eq!(driver.stop_sampling().resume_offset(), 4 * RECORD_LEN);
}

#[test]
fn test_resume_inside_a_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_log(dir.path(), 1, 4);

    // 偏移落在第二条记录中间：丢弃到行尾后继续
    let memento = DriverState::at(&path, 100, None);
    let (mut driver, events) = driver(config(dir.path()), Some(memento));
    driver.start_sampling().unwrap();
    assert_eq!(particles(&events, 2).len(), 2);
    assert_eq!(driver.stop_sampling().resume_offset(), 4 * RECORD_LEN);
}

#[test]
fn test_truncated_resume_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_log(dir.path(), 1, 2);
    write_log(dir.path(), 2, 4);

    let memento = DriverState::at(&first, 3 * RECORD_LEN, None);
    let (mut driver, events) = driver(config(dir.path()), Some(memento));
    driver.start_sampling().unwrap();
    assert!(exception(&events).contains("File consistency error"));
    assert_eq!(particles(&events, 4).len(), 4);
    driver.stop_sampling();
}

#[test]
fn test_truncation_while_reading() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_log(dir.path(), 1, 2);
    let (mut driver, events) = driver(config(dir.path()), None);
    driver.start_sampling().unwrap();
    particles(&events, 2);

    fs::write(&first, record(1, 0)).unwrap();
    assert!(exception(&events).contains("File consistency error"));

    // 其他文件照常采集
    write_log(dir.path(), 2, 3);
    assert_eq!(particles(&events, 3).len(), 3);
    driver.stop_sampling();
}

#[test]
fn test_rewrite_in_place_past_offset() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_log(dir.path(), 1, 2);
    let (mut driver, events) = driver(config(dir.path()), None);
    driver.start_sampling().unwrap();
    particles(&events, 2);

    // 原地截断后写入更多内容，长度超过已读位置
    let rewritten: String = (0..3).map(|i| record(9, i)).collect();
    fs::write(&first, rewritten).unwrap();
    assert!(exception(&events).contains("File consistency error"));

    write_log(dir.path(), 2, 1);
    let got = particles(&events, 1);
    assert_eq!(got[0].get("date_string"), Some(&ParticleValue::Text("01/02/13".into())));
    driver.stop_sampling();
}

#[test]
fn test_stop_start_has_no_gaps_or_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    write_log(dir.path(), 1, 10);

    let mut config = config(dir.path());
    config.records_per_second = Some(20.0);
    let (mut driver, events) = driver(config, None);

    let mut seen = Vec::new();
    let mut restarts = 0;
    let deadline = Instant::now() + Duration::from_secs(20);
    while seen.len() < 10 && Instant::now() < deadline {
        driver.start_sampling().unwrap();
        std::thread::sleep(Duration::from_millis(120));
        driver.stop_sampling();
        restarts += 1;
        seen.extend(events.try_iter().filter_map(|e| match e {
            DatasetEvent::Particle(p) => Some(p.timestamp()),
            _ => None,
        }));
    }
    assert!(restarts > 1);
    assert_eq!(seen.len(), 10);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(driver.state().resume_offset(), 10 * RECORD_LEN);
}

#[test]
fn test_state_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    write_log(&data, 1, 3);
    let state_path = dir.path().join("flort.state.json");

    {
        let store = JsonStateStore::open(&state_path).unwrap();
        let memento = store.load().unwrap();
        let (driver, events) = driver(config(&data), memento);
        let mut driver = driver.with_store(store);
        driver.start_sampling().unwrap();
        particles(&events, 3);
        driver.stop_sampling();
    }

    write_log(&data, 1, 1);
    let store = JsonStateStore::open(&state_path).unwrap();
    let memento = store.load().unwrap();
    assert_eq!(memento.as_ref().map(DriverState::resume_offset), Some(3 * RECORD_LEN));

    let (driver, events) = driver(config(&data), memento);
    let mut driver = driver.with_store(store);
    driver.start_sampling().unwrap();
    assert_eq!(particles(&events, 1).len(), 1);
    driver.stop_sampling();
}

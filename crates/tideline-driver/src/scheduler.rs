//! 定时任务
//!
//! 独立线程按间隔向请求通道投递事件。状态不合法的触发在 IO 线程中是
//! 无操作（仅记录日志与计数）。

use crate::config::SchedulerConfig;
use crate::event::ProtocolEvent;
use crate::pipeline::Request;
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 任务种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ClockSync,
    GetCalibration,
    GetConfiguration,
}

impl JobKind {
    pub fn event(self) -> ProtocolEvent {
        match self {
            Self::ClockSync => ProtocolEvent::ScheduledClockSync,
            Self::GetCalibration => ProtocolEvent::GetCalibration,
            Self::GetConfiguration => ProtocolEvent::GetConfiguration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub interval: Duration,
}

/// 根据配置生成任务列表（未配置间隔的任务不启用）
pub fn jobs_from_config(config: &SchedulerConfig) -> Vec<ScheduledJob> {
    [
        (JobKind::ClockSync, config.clock_sync_secs),
        (JobKind::GetCalibration, config.get_calibration_secs),
        (JobKind::GetConfiguration, config.get_configuration_secs),
    ]
    .into_iter()
    .filter_map(|(kind, secs)| {
        let secs = secs.filter(|s| s.is_finite() && *s > 0.0)?;
        Some(ScheduledJob {
            kind,
            interval: Duration::from_secs_f64(secs),
        })
    })
    .collect()
}

/// 定时任务线程
#[derive(Debug)]
pub struct Scheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// 启动定时线程；没有任务时不创建线程
    pub fn start(jobs: Vec<ScheduledJob>, req_tx: Sender<Request>) -> Self {
        if jobs.is_empty() {
            return Self {
                stop_tx: None,
                handle: None,
            };
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("tideline-scheduler".into())
            .spawn(move || {
                let now = Instant::now();
                let mut next: Vec<Instant> = jobs.iter().map(|j| now + j.interval).collect();

                loop {
                    let due = next.iter().min().copied().unwrap_or(now);
                    let wait = due.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {},
                    }

                    let now = Instant::now();
                    for (job, at) in jobs.iter().zip(next.iter_mut()) {
                        if *at > now {
                            continue;
                        }
                        *at = now + job.interval;
                        let event = job.kind.event();
                        debug!("Scheduler firing {}", event);
                        match req_tx.try_send(Request::Scheduled(event)) {
                            Ok(()) => {},
                            Err(TrySendError::Full(_)) => {
                                warn!("Request queue full, dropping scheduled {}", event);
                            },
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                }
            });

        match handle {
            Ok(handle) => Self {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Failed to spawn scheduler thread: {}", e);
                Self {
                    stop_tx: None,
                    handle: None,
                }
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 停止并等待线程退出
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

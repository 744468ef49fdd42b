//! 驱动运行指标
//!
//! 原子计数器，IO 线程写入，任意线程通过 `snapshot()` 读取。

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// 接收字节数
    pub bytes_received: AtomicU64,
    /// 成功解码并发布的粒子数
    pub particles_published: AtomicU64,
    /// 解码失败被丢弃的记录数
    pub chunks_rejected: AtomicU64,
    /// 发送的命令数（含重发）
    pub commands_sent: AtomicU64,
    /// 命令超时重发次数
    pub command_retries: AtomicU64,
    /// 重试耗尽的命令数
    pub command_timeouts: AtomicU64,
    /// 定时任务触发次数
    pub scheduled_fired: AtomicU64,
    /// 因状态不合法而跳过的定时任务次数
    pub scheduled_skipped: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            particles_published: self.particles_published.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_retries: self.command_retries.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            scheduled_fired: self.scheduled_fired.load(Ordering::Relaxed),
            scheduled_skipped: self.scheduled_skipped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_received: u64,
    pub particles_published: u64,
    pub chunks_rejected: u64,
    pub commands_sent: u64,
    pub command_retries: u64,
    pub command_timeouts: u64,
    pub scheduled_fired: u64,
    pub scheduled_skipped: u64,
}

impl MetricsSnapshot {
    /// 命令超时率（重试次数 / 发送次数）
    pub fn retry_rate(&self) -> f64 {
        if self.commands_sent == 0 {
            0.0
        } else {
            self.command_retries as f64 / self.commands_sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = DriverMetrics::new();
        DriverMetrics::add(&metrics.commands_sent, 4);
        DriverMetrics::add(&metrics.command_retries, 1);
        DriverMetrics::add(&metrics.particles_published, 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.commands_sent, 4);
        assert_eq!(snap.particles_published, 3);
        assert!((snap.retry_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(MetricsSnapshot::default().retry_rate(), 0.0);
    }
}

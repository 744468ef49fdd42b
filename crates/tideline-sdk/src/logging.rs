//! 日志初始化
//!
//! 安装 `tracing-subscriber` 的 fmt 输出（由 `RUST_LOG` 控制级别），
//! 并把 `log` crate 的记录桥接到 tracing。

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "tideline=info";

/// 以默认级别初始化日志；重复调用无副作用
pub fn init_logging() {
    init_logging_with(DEFAULT_DIRECTIVES);
}

/// 以指定的默认过滤规则初始化日志（`RUST_LOG` 优先）
pub fn init_logging_with(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // 已有全局 subscriber
        return;
    }
    let _ = tracing_log::LogTracer::init_with_filter(log::LevelFilter::Trace);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init_logging();
        init_logging_with("debug");
        tracing::info!("logging initialized");
        log::info!("bridged from log");
    }
}

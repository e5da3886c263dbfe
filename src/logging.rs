//! 日志系统配置
//!
//! 库本身只通过 `tracing` 宏输出日志，不会主动安装订阅器。
//! 宿主应用可以调用 `init_logging` 获得控制台输出，以及按天滚动的日志文件。

use crate::config::LogConfig;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "cloud-transfer-session";

const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 按天滚动的日志文件，超出保留天数的旧文件由 appender 自行删除
fn file_appender(config: &LogConfig) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(config.retention_days.max(1) as usize)
        .build(&config.log_dir)
}

/// 初始化日志系统
///
/// 重复初始化（例如宿主已经安装了自己的订阅器）时静默返回
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(true);

    let appender = if config.enabled {
        match file_appender(config) {
            Ok(appender) => Some(appender),
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    let Some(appender) = appender else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
            config.log_dir, config.retention_days, config.level
        );
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn log_config(dir: &std::path::Path) -> LogConfig {
        LogConfig {
            enabled: true,
            log_dir: dir.to_path_buf(),
            ..LogConfig::default()
        }
    }

    #[test]
    fn test_file_appender_writes_prefixed_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut appender = file_appender(&log_config(temp_dir.path())).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(LOG_FILE_PREFIX));
        assert!(names[0].ends_with(".log"));
    }

    #[test]
    fn test_zero_retention_keeps_current_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig {
            retention_days: 0,
            ..log_config(temp_dir.path())
        };
        let mut appender = file_appender(&config).unwrap();
        appender.write_all(b"x").unwrap();
        appender.flush().unwrap();

        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_disabled_file_logging_returns_empty_guard() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig {
            enabled: false,
            log_dir: temp_dir.path().join("logs"),
            ..LogConfig::default()
        };
        let guard = init_logging(&config);
        assert!(guard._file_guard.is_none());
        assert!(!config.log_dir.exists());
    }
}

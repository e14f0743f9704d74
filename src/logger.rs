// 日志初始化 - 同时输出到控制台和按天轮转的日志文件

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const APP_DIR: &str = "dialogue-analyzer";
const LOG_FILE: &str = "dialogue-analyzer.log";

/// 平台默认日志目录
pub fn default_log_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join("Library/Logs").join(APP_DIR)
    } else if cfg!(target_os = "windows") {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join(APP_DIR).join("logs")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".local/share").join(APP_DIR).join("logs")
    }
}

/// 优先使用配置的目录
pub fn resolve_log_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(default_log_dir)
}

/// 初始化全局日志
///
/// 日志级别由 `RUST_LOG` 控制，默认 `info`。
/// 返回的 guard 需要在整个运行期间持有，drop 时会刷新文件缓冲。
pub fn init(log_dir: Option<&Path>) -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir(log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("创建日志目录失败: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let writer = std::io::stdout.and(non_blocking);

    let timer = LocalTime::new(time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_timer(timer)
        .with_ansi(cfg!(debug_assertions))
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("设置全局日志失败")?;

    eprintln!("日志文件位置: {:?}", log_dir);
    Ok(guard)
}

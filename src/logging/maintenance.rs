//! 日志文件维护: 每日翻滚、压缩历史、清理过期文件.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, error};

use super::{LoggingConfig, log_file_path};

/// 一次维护的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub removed: usize,
    pub compressed: usize,
}

pub(super) fn spawn(
    handle: &tokio::runtime::Handle,
    config: LoggingConfig,
    reopen: Arc<AtomicBool>,
) {
    handle.spawn(async move {
        let period = Duration::from_secs(config.cleanup_interval_seconds.max(1));
        let mut cleanup = tokio::time::interval(period);
        let mut rollover = tokio::time::Instant::now() + until_next_midnight(Local::now());

        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    log_report(run_maintenance(&config, Local::now().date_naive()));
                }
                _ = tokio::time::sleep_until(rollover) => {
                    // 下一次写入时打开新日期的文件
                    reopen.store(true, Ordering::Release);
                    log_report(run_maintenance(&config, Local::now().date_naive()));
                    rollover = tokio::time::Instant::now() + until_next_midnight(Local::now());
                }
            }
        }
    });
}

fn log_report(result: Result<MaintenanceReport>) {
    match result {
        Ok(report) if report != MaintenanceReport::default() => debug!(
            "日志维护: 删除 {} 个, 压缩 {} 个",
            report.removed, report.compressed
        ),
        Ok(_) => {}
        Err(err) => error!("日志维护失败: {:#}", err),
    }
}

/// 以 `today` 为当天执行一次维护
///
/// 早于 `today - retention_days` 的文件被删除; 开启压缩时, 早于当天的 `.log` 压缩为 `.log.gz`.
pub fn run_maintenance(config: &LoggingConfig, today: NaiveDate) -> Result<MaintenanceReport> {
    let directory = Path::new(&config.directory);
    let mut report = MaintenanceReport::default();
    if !directory.exists() {
        return Ok(report);
    }
    let cutoff = today - ChronoDuration::days(config.retention_days);

    let entries = fs::read_dir(directory)
        .with_context(|| format!("读取日志目录失败, path={}", directory.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((date, compressed)) = parse_log_name(name, &config.file_prefix) else {
            continue;
        };

        if date < cutoff {
            fs::remove_file(&path)
                .with_context(|| format!("删除过期日志失败, path={}", path.display()))?;
            report.removed += 1;
        } else if config.compress_history && !compressed && date < today {
            gzip_file(&path)?;
            report.compressed += 1;
        }
    }

    // 保证当天文件存在
    let current = log_file_path(directory, &config.file_prefix, today);
    if !current.exists() {
        File::create(&current)
            .with_context(|| format!("创建当天日志失败, path={}", current.display()))?;
    }
    Ok(report)
}

fn gzip_file(path: &Path) -> Result<()> {
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    if !gz_path.exists() {
        let mut input = File::open(path)
            .with_context(|| format!("打开待压缩日志失败, path={}", path.display()))?;
        let output = File::create(&gz_path)
            .with_context(|| format!("创建压缩日志失败, path={}", gz_path.display()))?;
        let mut encoder = GzEncoder::new(output, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
    }
    fs::remove_file(path).with_context(|| format!("删除已压缩日志失败, path={}", path.display()))
}

/// 解析 `<prefix>.<YYYY-MM-DD>.log[.gz]`, 返回日期与是否已压缩
fn parse_log_name(name: &str, prefix: &str) -> Option<(NaiveDate, bool)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('.')?;
    let (date, compressed) = match rest.strip_suffix(".log.gz") {
        Some(date) => (date, true),
        None => (rest.strip_suffix(".log")?, false),
    };
    if date.len() != 10 {
        return None;
    }
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some((date, compressed))
}

/// 距下一个本地午夜的时长
fn until_next_midnight(now: DateTime<Local>) -> Duration {
    let next = (now.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest());
    match next {
        Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
        None => Duration::from_secs(60),
    }
}

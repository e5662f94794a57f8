//! Logging infrastructure
//!
//! - Console output, pretty or JSON
//! - Daily rotating application logs under `<LOG_DIR>/app` (pruned after 14 days)
//! - Permanent audit logs under `<LOG_DIR>/audit` for ERP postings, pushes and
//!   settlement closes (target `audit`)

use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, prelude::*};

const APP_LOG_RETENTION_DAYS: i64 = 14;

/// Delete `app-YYYY-MM-DD.log` files older than the retention window.
/// Returns the number of files removed.
pub fn cleanup_old_logs(log_dir: &Path, today: chrono::NaiveDate) -> anyhow::Result<usize> {
    let cutoff = today - chrono::Duration::days(APP_LOG_RETENTION_DAYS);
    let app_log_dir = log_dir.join("app");
    if !app_log_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(app_log_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(date_part) = name
            .strip_prefix("app.")
            .or_else(|| name.strip_prefix("app-"))
            .map(|d| d.trim_end_matches(".log"))
            && let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            && date < cutoff
        {
            fs::remove_file(&path)?;
            removed += 1;
            tracing::info!(file = %name, "Deleted old log file");
        }
    }
    Ok(removed)
}

/// Initialize the logging system
///
/// `RUST_LOG` overrides `level` when set. With `log_dir`, application and
/// audit logs are also written to daily rolling files.
pub fn init_logger(level: &str, json_format: bool, log_dir: Option<&str>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    let console_layer = if json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let Some(dir) = log_dir else {
        subscriber.with(console_layer).init();
        return Ok(());
    };

    let log_dir = Path::new(dir);
    let app_log_dir = log_dir.join("app");
    let audit_log_dir = log_dir.join("audit");
    fs::create_dir_all(&app_log_dir)?;
    fs::create_dir_all(&audit_log_dir)?;

    let app_log = RollingFileAppender::new(Rotation::DAILY, app_log_dir, "app");
    let app_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::sync::Mutex::new(app_log))
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
            meta.target() != "audit"
        }));

    let audit_log = RollingFileAppender::new(Rotation::DAILY, audit_log_dir, "audit");
    let audit_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_writer(std::sync::Mutex::new(audit_log))
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
            meta.target() == "audit"
        }));

    tokio::spawn(periodic_cleanup(log_dir.to_path_buf()));

    subscriber
        .with(console_layer)
        .with(app_layer)
        .with(audit_layer)
        .init();
    Ok(())
}

/// Runs hourly
async fn periodic_cleanup(log_dir: PathBuf) {
    use tokio::time::{Duration, sleep};

    loop {
        sleep(Duration::from_secs(3600)).await;
        let today = chrono::Utc::now().date_naive();
        if let Err(e) = cleanup_old_logs(&log_dir, today) {
            tracing::error!(error = %e, "Failed to cleanup old logs");
        }
    }
}

/// Audit log helper for externally visible side effects
///
/// ```ignore
/// audit_log!("tenant-1", "erp_post", "posting:3f2a...", "erp_reference=INV-0042");
/// ```
#[macro_export]
macro_rules! audit_log {
    ($tenant_id:expr, $action:expr, $resource:expr) => {
        tracing::info!(
            target: "audit",
            tenant_id = $tenant_id,
            action = $action,
            resource = $resource,
            "AUDIT"
        );
    };
    ($tenant_id:expr, $action:expr, $resource:expr, $details:expr) => {
        tracing::info!(
            target: "audit",
            tenant_id = $tenant_id,
            action = $action,
            resource = $resource,
            details = $details,
            "AUDIT"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_removes_only_expired_app_logs() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("app.2026-01-01"), b"old").unwrap();
        fs::write(app.join("app.2026-01-20"), b"recent").unwrap();
        fs::write(app.join("notes.txt"), b"keep").unwrap();

        let today = chrono::NaiveDate::from_ymd_opt(2026, 1, 25).unwrap();
        let removed = cleanup_old_logs(dir.path(), today).unwrap();

        assert_eq!(removed, 1);
        assert!(!app.join("app.2026-01-01").exists());
        assert!(app.join("app.2026-01-20").exists());
        assert!(app.join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_without_app_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let today = chrono::NaiveDate::from_ymd_opt(2026, 1, 25).unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), today).unwrap(), 0);
    }
}

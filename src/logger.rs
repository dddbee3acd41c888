//! Tracing subscriber setup for the node binary and tests.

use std::sync::LazyLock;
use tracing_subscriber::{fmt, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static HOSTNAME: LazyLock<String> = LazyLock::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
});

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    /// Compact lines plus a startup record of host and memory.
    Detailed,
    #[cfg(feature = "json")]
    Json,
}

impl LogFormat {
    /// Reads `ISAAC_LOG_FORMAT`; unknown values fall back to compact.
    pub fn from_env() -> Self {
        match std::env::var("ISAAC_LOG_FORMAT").as_deref() {
            Ok("detailed") => LogFormat::Detailed,
            #[cfg(feature = "json")]
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Resident memory of this process, like `12.3M`.
fn memory_usage() -> String {
    #[cfg(target_os = "linux")]
    {
        let rss = std::fs::read_to_string("/proc/self/status").ok().and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok())
        });
        if let Some(kb) = rss {
            return format!("{:.1}M", kb / 1024.0);
        }
    }

    use sysinfo::{Pid, System};
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_process(pid);
    match system.process(pid) {
        Some(process) => format!("{:.1}M", process.memory() as f64 / (1024.0 * 1024.0)),
        None => "N/A".to_string(),
    }
}

pub fn hostname() -> &'static str {
    &HOSTNAME
}

/// Installs the global subscriber. `.env` is loaded first so `RUST_LOG`
/// may come from it.
pub fn init_logger(format: LogFormat) {
    dotenvy::dotenv().ok();

    let registry = tracing_subscriber::registry().with(filter());
    match format {
        LogFormat::Compact | LogFormat::Detailed => registry
            .with(
                fmt::layer()
                    .with_timer(ChronoLocal::rfc_3339())
                    .with_target(false)
                    .with_level(true)
                    .with_file(format == LogFormat::Detailed)
                    .with_line_number(format == LogFormat::Detailed)
                    .compact(),
            )
            .init(),
        #[cfg(feature = "json")]
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_timer(ChronoLocal::rfc_3339())
                    .with_target(true)
                    .with_current_span(true),
            )
            .init(),
    }

    if format == LogFormat::Detailed {
        tracing::info!(hostname = %hostname(), memory = %memory_usage(), "logger initialized");
    } else {
        tracing::debug!(?format, "logger initialized");
    }
}

/// Test-writer subscriber, `error` unless `RUST_LOG` says otherwise.
#[cfg(test)]
pub fn init_test_logger() {
    static INIT: std::sync::Once = std::sync::Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")))
            .with(
                fmt::layer()
                    .with_writer(fmt::TestWriter::default())
                    .with_target(false)
                    .with_ansi(false)
                    .compact(),
            )
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_usage_is_reported() {
        let m = memory_usage();
        assert!(m == "N/A" || m.ends_with('M'));
        assert!(!hostname().is_empty());
    }
}

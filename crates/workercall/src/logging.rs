//! Tracing setup with WORKERCALL_LOG and LOG_FORMAT support.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive used when RUST_LOG is not set.
pub fn default_filter(log_level: Option<&str>) -> String {
    let base_level = match log_level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "workercall={level},workercall::bridge::codec=off",
        level = base_level
    )
}

/// Initialize tracing. Logs go to stderr: stdout may be the worker protocol pipe.
///
/// RUST_LOG wins when set; otherwise WORKERCALL_LOG picks the level.
/// LOG_FORMAT=json switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("WORKERCALL_LOG").ok();
        EnvFilter::new(default_filter(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

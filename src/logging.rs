use std::sync::Once;

use log::LevelFilter;

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "STN_BLE_LOG";

static LOG_ONCE: Once = Once::new();

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Filter directive to use: `STN_BLE_LOG`, then `RUST_LOG`, then the
/// configured level, then `info`.
///
/// Environment values are passed through untouched so module directives such
/// as `stn_ble::poller=debug` keep working. An unparsable configured level
/// falls back to `info`.
pub fn resolve_filter(
    configured: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> String {
    env(LOG_ENV)
        .or_else(|| env("RUST_LOG"))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| {
            level_to_str(parse_level(configured).unwrap_or(LevelFilter::Info)).to_string()
        })
}

/// Initialize the stderr logger. Only the first call has any effect.
pub fn init_logging(configured: Option<&str>) {
    LOG_ONCE.call_once(|| {
        let filter = resolve_filter(configured, |key| std::env::var(key).ok());
        env_logger::Builder::new()
            .parse_filters(&filter)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since `1970-01-01 00:00:00`, named [`UNIX_EPOCH`].
///
/// Inode timestamps are stored with second granularity only.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render a unix-seconds timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_timestamp(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

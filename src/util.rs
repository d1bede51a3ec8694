use rand::{Rng, RngCore};

pub fn normalize_log_level(level: &str) -> Option<&'static str> {
    match level.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

pub fn now_unix_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `now` moved back by a uniform random amount in `0..=window` seconds.
/// Never lands in the future and never underflows.
pub fn jittered_timestamp(now: u64, window: u64) -> u64 {
    if window == 0 {
        return now;
    }
    let back = rand::thread_rng().gen_range(0..=window);
    now.saturating_sub(back)
}

pub fn random_hex(bytes_len: usize) -> String {
    let mut buf = vec![0u8; bytes_len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

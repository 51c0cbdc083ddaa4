use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

fn shorten(value: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= head + tail {
        return value.to_string();
    }
    let head: String = chars[..head].iter().collect();
    let tail: String = chars[chars.len() - tail..].iter().collect();
    format!("{head}..{tail}")
}

/// Log-friendly form of a download URI: magnet links keep only their info hash (shortened) and
/// drop tracker lists; long paths are shortened in the middle.
pub fn redact_uri(uri: &str) -> String {
    if let Some(query) = uri.strip_prefix("magnet:?") {
        let hash = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("xt="))
            .map(|xt| xt.rsplit(':').next().unwrap_or(xt))
            .unwrap_or("");
        return format!("magnet:{}", shorten(hash, 8, 8));
    }
    shorten(uri, 24, 24)
}

/// Returns `true` when the caller should emit its warning now. Repeats within `interval` are
/// counted, and the count is reported with the next warning that gets through.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    let Some(suppressed) = warn_throttled_with_count(key, interval) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(
            event = "throttled_warning_summary",
            key,
            suppressed,
            "throttled warnings were suppressed"
        );
    }
    true
}

fn throttle_map() -> &'static Mutex<HashMap<&'static str, WarnThrottleState>> {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, WarnThrottleState>>> = OnceLock::new();
    LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn warn_throttled_with_count(key: &'static str, interval: Duration) -> Option<u64> {
    let mut guard = match throttle_map().lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("warn throttle lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    };
    let now = Instant::now();
    match guard.get_mut(key) {
        Some(state) if now.saturating_duration_since(state.last) < interval => {
            state.suppressed = state.suppressed.saturating_add(1);
            None
        }
        Some(state) => {
            let suppressed = std::mem::take(&mut state.suppressed);
            state.last = now;
            Some(suppressed)
        }
        None => {
            guard.insert(
                key,
                WarnThrottleState {
                    last: now,
                    suppressed: 0,
                },
            );
            Some(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnet_uris_keep_only_a_short_hash() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&tr=udp://t.example:80";
        assert_eq!(redact_uri(uri), "magnet:01234567..01234567");
    }

    #[test]
    fn short_uris_are_unchanged() {
        assert_eq!(redact_uri("file:///tmp/seed"), "file:///tmp/seed");
    }

    #[test]
    fn throttle_counts_suppressed_repeats() {
        let key = "logging_test_throttle";
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(60)), Some(0));
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(60)), None);
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(60)), None);
        assert_eq!(warn_throttled_with_count(key, Duration::ZERO), Some(2));
    }

    #[test]
    fn throttle_keeps_working_after_lock_poisoning() {
        let _ = std::thread::spawn(|| {
            let _guard = throttle_map().lock();
            panic!("poison the throttle map");
        })
        .join();
        assert!(throttle_map().is_poisoned());

        let key = "logging_test_poisoned";
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(60)), Some(0));
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(60)), None);
    }
}

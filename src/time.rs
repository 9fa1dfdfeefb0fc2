use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch, as an `f64` so it can be packed
/// directly into announce and known-destination records the way the wire
/// format expects.
pub fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Milliseconds since the Unix epoch, used for event timestamps that don't
/// need sub-millisecond precision.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_secs_is_monotonic_increasing_across_calls() {
        let a = now_secs();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_secs();
        assert!(b >= a);
    }
}

use chrono::Utc;

/// Wall clock in milliseconds since the Unix epoch, the unit the selector
/// uses for readiness and wakeup times.
pub fn now_ms() -> u64 {
    // before 1970 only on a broken clock; treat as "unknown"
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_past_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}

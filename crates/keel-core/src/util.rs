//! Small helpers shared by the store, config and coordinator.

const MAX_REASON_CHARS: usize = 180;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Trimmed text, or `None` for missing and blank input.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Failure reasons are stored on the change row; keep them short.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(MAX_REASON_CHARS).collect()
}

/// Wall clock in Unix milliseconds, the unit of every stored timestamp.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Timestamp `days` whole days before `now_ms`, for purge cutoffs.
pub fn days_before(now_ms: i64, days: u32) -> i64 {
    now_ms.saturating_sub(i64::from(days).saturating_mul(DAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_is_none() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some(" \t ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some(" laptop ".to_string())),
            Some("laptop".to_string())
        );
    }

    #[test]
    fn reasons_are_capped() {
        let long = "x".repeat(500);
        assert_eq!(compact_text(&long).len(), MAX_REASON_CHARS);
        assert_eq!(compact_text("  timeout  "), "timeout");
    }

    #[test]
    fn days_before_subtracts_whole_days() {
        assert_eq!(days_before(10 * DAY_MS, 3), 7 * DAY_MS);
        assert_eq!(days_before(0, 0), 0);
        assert_eq!(days_before(i64::MIN, 1), i64::MIN);
    }
}

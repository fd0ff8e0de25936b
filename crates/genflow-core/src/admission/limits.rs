//! Counter keys and windows for the admission limits.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::Tier;

/// Daily window for a tier-scoped limit, one key per UTC day.
pub fn daily_key(tier: Tier, user_id: &str, now: DateTime<Utc>) -> String {
    format!("daily:{}:{user_id}:{}", tier.as_str(), now.format("%Y-%m-%d"))
}

pub fn rate_key(user_id: &str) -> String {
    format!("rate:{user_id}")
}

/// Time left until the next UTC midnight, at least one second.
pub fn until_utc_midnight(now: DateTime<Utc>) -> Duration {
    let remaining = now
        .date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| (midnight.and_utc() - now).to_std().ok())
        .unwrap_or(Duration::from_secs(86_400));
    remaining.max(Duration::from_secs(1))
}

/// Retry hints are whole seconds and never zero.
pub fn retry_hint(remaining: Duration) -> Duration {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn daily_key_is_scoped_to_tier_user_and_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(daily_key(Tier::Free, "u1", now), "daily:free:u1:2024-03-09");
    }

    #[rstest]
    #[case::one_minute_before(Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap(), 60)]
    #[case::at_midnight(Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap(), 86_400)]
    #[case::month_end(Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap(), 43_200)]
    fn midnight_distance(#[case] now: DateTime<Utc>, #[case] secs: u64) {
        assert_eq!(until_utc_midnight(now), Duration::from_secs(secs));
    }

    #[rstest]
    #[case::rounds_up(Duration::from_millis(1500), 2)]
    #[case::exact(Duration::from_secs(3), 3)]
    #[case::zero_becomes_one(Duration::ZERO, 1)]
    fn retry_hints(#[case] remaining: Duration, #[case] secs: u64) {
        assert_eq!(retry_hint(remaining), Duration::from_secs(secs));
    }
}

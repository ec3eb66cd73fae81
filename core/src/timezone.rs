//! Timezone resolution helper shared by the router's temporal filter extraction.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Resolves `tz_name` to the current instant, viewed as if in that zone, falling back
/// to UTC for an unrecognized or empty zone name. Callers take `.date_naive()` off the
/// result to get a calendar day anchored to the user's timezone rather than UTC's.
pub fn now_in_timezone(tz_name: &str) -> DateTime<Utc> {
    if tz_name.trim().is_empty() {
        return Utc::now();
    }
    match tz_name.parse::<Tz>() {
        Ok(tz) => {
            let local = Utc::now().with_timezone(&tz);
            DateTime::<Utc>::from_naive_utc_and_offset(local.naive_local(), Utc)
        }
        Err(_) => Utc::now(),
    }
}

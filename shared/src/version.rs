use chrono::{DateTime, Utc};

/// TAI is ahead of UTC by the accumulated leap seconds (37 since 2017-01-01).
const TAI_UTC_OFFSET_SECS: i64 = 37;

/// Current time as an NMOS version stamp: TAI "<seconds>:<nanoseconds>".
pub fn tai_now() -> String {
    tai_version(Utc::now())
}

pub fn tai_version(at: DateTime<Utc>) -> String {
    format!(
        "{}:{}",
        at.timestamp() + TAI_UTC_OFFSET_SECS,
        at.timestamp_subsec_nanos()
    )
}

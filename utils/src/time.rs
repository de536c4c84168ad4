use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix epoch seconds. Store methods take the
/// timestamp as an argument instead of calling this themselves, so tests
/// can supply fixed clocks.
pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(_) => 0,
    }
}

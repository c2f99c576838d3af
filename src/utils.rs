/// Utility functions for time handling and retries
use log::warn;
use std::fmt::Display;
use std::future::Future;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::{sleep, Duration};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Current unix time in whole seconds
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Current wall-clock time at the given offset
pub fn local_now(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Time left until the next wall-clock minute boundary
pub fn until_next_minute(now: &OffsetDateTime) -> Duration {
    let elapsed =
        Duration::from_secs(now.second() as u64) + Duration::from_nanos(now.nanosecond() as u64);
    Duration::from_secs(60).saturating_sub(elapsed)
}

/// Run `operation` until it succeeds or `attempts` tries have failed
///
/// Every failure is logged with `what`; the last error is returned once the
/// budget is spent.
///
/// # Arguments
/// * `attempts` - Total number of tries (at least one is always made)
/// * `delay` - Pause between tries
/// * `what` - Description used in log lines
/// * `operation` - Produces one attempt
pub async fn with_retry<T, E, F, Fut>(
    attempts: usize,
    delay: Duration,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!("Attempt {}/{} {}: {}", attempt, attempts, what, e);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }
    }
}

use chrono::{DateTime, Duration, Local};
use crate::errors::{Result, StreamError};

/// Parse a duration string like "10m", "5h", "7d" into a chrono::Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let Some(unit) = s.chars().last() else {
        return Err(StreamError::config("Empty duration string"));
    };
    let (number_part, unit_part) = s.split_at(s.len() - unit.len_utf8());

    let value: i64 = number_part.parse()
        .map_err(|_| StreamError::config(format!("Invalid number in duration: {}", number_part)))?;

    if value <= 0 {
        return Err(StreamError::config("Duration must be positive"));
    }

    let duration = match unit_part {
        "m" => Duration::minutes(value),
        "h" => Duration::hours(value),
        "d" => Duration::days(value),
        _ => return Err(StreamError::config(format!("Invalid duration unit '{}'. Use 'm' for minutes, 'h' for hours, or 'd' for days", unit_part))),
    };

    Ok(duration)
}

/// Strip the password from a stream URL so it can be logged.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Wall-clock source used for naming recording segments and for the
/// periodic status cadence.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Sortable timestamp used in segment file names.
pub fn segment_timestamp(time: &DateTime<Local>) -> String {
    time.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Wall clock that follows tokio's (possibly paused) clock.
#[cfg(test)]
pub struct TokioClock {
    anchor_wall: DateTime<Local>,
    anchor: tokio::time::Instant,
}

#[cfg(test)]
impl TokioClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Local::now(),
            anchor: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Local> {
        let elapsed = tokio::time::Instant::now() - self.anchor;
        self.anchor_wall + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
    }
}

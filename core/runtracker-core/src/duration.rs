//! `HH:MM:SS` formatting for run durations.
//!
//! Hours are unbounded (a 30 hour run renders as `30:00:00`), minutes and
//! seconds are always two digits.

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * 60;

/// Formats an elapsed number of seconds as `HH:MM:SS`.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / SECS_PER_HOUR;
    let minutes = (seconds % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let secs = seconds % SECS_PER_MINUTE;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Formats a possibly negative duration; negative values get a leading `-`.
///
/// Durations go negative when "now" precedes a run's start date (clock skew or
/// an overridden start date in the future). They are shown, not clamped.
pub fn format_signed_duration(seconds: i64) -> String {
    if seconds < 0 {
        format!("-{}", format_duration(seconds.unsigned_abs()))
    } else {
        format_duration(seconds.unsigned_abs())
    }
}

/// Parses `HH:MM:SS` back into seconds.
///
/// Accepts any number of hour digits; minutes and seconds must be two digits
/// below 60.
pub fn parse_hms(value: &str) -> Option<u64> {
    let mut parts = value.trim().split(':');
    let (hours, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let hours = parse_digits(hours)?;
    let minutes = parse_field(minutes)?;
    let seconds = parse_field(seconds)?;

    hours
        .checked_mul(SECS_PER_HOUR)?
        .checked_add(minutes * SECS_PER_MINUTE + seconds)
}

fn parse_field(value: &str) -> Option<u64> {
    if value.len() != 2 {
        return None;
    }
    parse_digits(value).filter(|v| *v < 60)
}

fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

//! Human-readable durations for lease and retry settings ("1h", "30s", "250ms").

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};

/// Parse a duration string like "1h", "30s" or "250ms".
///
/// Supported units:
/// - `d` - days (24 hours)
/// - `h` - hours
/// - `m` - minutes
/// - `s` - seconds
/// - `ms` - milliseconds
///
/// The input is case-insensitive and whitespace is trimmed.
///
/// # Examples
///
/// ```
/// use vaultjwt::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .context("Duration must end with a unit (d, h, m, s or ms)")?;
    let (num, unit) = s.split_at(split);

    let num: u64 = num
        .parse()
        .with_context(|| format!("Invalid number in duration: {s:?}"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num.checked_mul(60).context("Duration is too large")?),
        "h" => Duration::from_secs(num.checked_mul(60 * 60).context("Duration is too large")?),
        "d" => Duration::from_secs(
            num.checked_mul(24 * 60 * 60)
                .context("Duration is too large")?,
        ),
        other => anyhow::bail!("Unknown duration unit {other:?}; expected d, h, m, s or ms"),
    };

    Ok(duration)
}

/// Format a duration using the largest unit that divides it evenly.
///
/// Sub-second remainders are rendered in milliseconds.
pub fn format_duration(d: Duration) -> String {
    const SECS_PER_DAY: u64 = 24 * 60 * 60;
    const SECS_PER_HOUR: u64 = 60 * 60;
    const SECS_PER_MINUTE: u64 = 60;

    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }

    let secs = d.as_secs();
    if secs >= SECS_PER_DAY && secs % SECS_PER_DAY == 0 {
        format!("{}d", secs / SECS_PER_DAY)
    } else if secs >= SECS_PER_HOUR && secs % SECS_PER_HOUR == 0 {
        format!("{}h", secs / SECS_PER_HOUR)
    } else if secs >= SECS_PER_MINUTE && secs % SECS_PER_MINUTE == 0 {
        format!("{}m", secs / SECS_PER_MINUTE)
    } else {
        format!("{secs}s")
    }
}

/// Serde deserializer for duration strings.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

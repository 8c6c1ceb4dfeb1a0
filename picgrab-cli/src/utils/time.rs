use std::time::Duration;

use crate::error::AppError;

/// Parse a duration with an optional unit (s, m, h, d). Plain numbers are seconds.
pub fn parse_duration(time_str: &str) -> Result<Duration, AppError> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    let split_index = time_str
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(time_str.len());

    let numeric_part = &time_str[..split_index];
    let unit_part = time_str[split_index..].trim().to_lowercase();

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number: {time_str}")))?;

    let seconds = match unit_part.as_str() {
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        other => return Err(AppError::ParseError(format!("Invalid time unit: {other}"))),
    };
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| AppError::ParseError(format!("Duration out of range: {time_str}")))
}

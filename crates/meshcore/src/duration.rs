use crate::ValidationError;
use std::time::Duration;

/// Parse a human duration such as `500ms`, `2s`, `1.5s`, `3m`, `1h` or `1m30s`.
///
/// A bare `0` is accepted. Any other number needs a unit.
pub fn parse_duration(text: &str) -> Result<Duration, ValidationError> {
    let input = text.trim();
    let invalid = || ValidationError::InvalidDuration(text.to_string());

    if input.is_empty() {
        return Err(invalid());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let amount: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let nanos = (amount * nanos_per_unit).round();
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Err(invalid());
        }
        let part = Duration::from_nanos(nanos as u64);
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}

//! Literal parsing and the single value-comparison rule used by every
//! comparison operator.

use std::cmp::Ordering;

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use super::ast::TimeSpec;

/// Compares a stored tag value with a query literal. Both sides numeric compare
/// as numbers; otherwise the comparison is lexicographic on the raw text, so
/// `rating=high` against `rating>3` silently falls back to string order.
pub fn compare_values(stored: &str, literal: &str) -> Ordering {
    match (parse_number(stored), parse_number(literal)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => stored.cmp(literal),
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Byte count with an optional unit. Binary units (`K`, `KiB`, ...) are powers
/// of 1024, decimal ones (`KB`, ...) powers of 1000.
pub fn parse_size(text: &str) -> Option<i64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kib" => 1024.0,
        "m" | "mib" => 1024.0_f64.powi(2),
        "g" | "gib" => 1024.0_f64.powi(3),
        "t" | "tib" => 1024.0_f64.powi(4),
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        _ => return None,
    };
    let bytes = (number * multiplier).round();
    (bytes.is_finite() && bytes >= 0.0 && bytes <= i64::MAX as f64).then_some(bytes as i64)
}

/// `now`, `now-7d`, `now+1h`, `YYYY-MM-DD` (midnight UTC) or RFC 3339.
pub fn parse_time(text: &str) -> Option<TimeSpec> {
    let text = text.trim();
    if let Some(rest) = strip_prefix_ignore_case(text, "now") {
        if rest.is_empty() {
            return Some(TimeSpec::Relative(0));
        }
        let (sign, amount) = match rest.as_bytes()[0] {
            b'-' => (-1, &rest[1..]),
            b'+' => (1, &rest[1..]),
            _ => return None,
        };
        let unit = amount.chars().last()?;
        let count: i64 = amount[..amount.len() - unit.len_utf8()].parse().ok()?;
        let seconds = match unit.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        return Some(TimeSpec::Relative(
            count.checked_mul(seconds)?.checked_mul(sign)?,
        ));
    }

    if let Ok(date) = Date::parse(text, format_description!("[year]-[month]-[day]")) {
        return Some(TimeSpec::Absolute(
            date.midnight().assume_utc().unix_timestamp(),
        ));
    }
    OffsetDateTime::parse(text, &Rfc3339)
        .ok()
        .map(|at| TimeSpec::Absolute(at.unix_timestamp()))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_compare_as_numbers() {
        assert_eq!(compare_values("10", "9"), Ordering::Greater);
        assert_eq!(compare_values("4.0", "4"), Ordering::Equal);
        assert_eq!(compare_values("-1", "0.5"), Ordering::Less);
    }

    #[test]
    fn mixed_values_fall_back_to_text_order() {
        // "10" < "9" as text
        assert_eq!(compare_values("10", "9x"), Ordering::Less);
        assert_eq!(compare_values("high", "4"), Ordering::Greater);
        assert_eq!(compare_values("apple", "banana"), Ordering::Less);
    }

    #[test]
    fn sizes_understand_binary_and_decimal_units() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("10MB"), Some(10_000_000));
        assert_eq!(parse_size("10M"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("1.5KiB"), Some(1536));
        assert_eq!(parse_size("2gb"), Some(2_000_000_000));
        assert_eq!(parse_size("3 K"), Some(3072));
        assert_eq!(parse_size("ten"), None);
        assert_eq!(parse_size("5XB"), None);
    }

    #[test]
    fn times_accept_relative_and_absolute_forms() {
        assert_eq!(parse_time("now"), Some(TimeSpec::Relative(0)));
        assert_eq!(parse_time("now-7d"), Some(TimeSpec::Relative(-7 * 86_400)));
        assert_eq!(parse_time("NOW+2h"), Some(TimeSpec::Relative(7_200)));
        assert_eq!(
            parse_time("2024-01-01"),
            Some(TimeSpec::Absolute(1_704_067_200))
        );
        assert_eq!(
            parse_time("2024-01-01T01:00:00Z"),
            Some(TimeSpec::Absolute(1_704_070_800))
        );
        assert_eq!(parse_time("now-7y"), None);
        assert_eq!(parse_time("now--9223372036854775808s"), None);
        assert_eq!(parse_time("now-9223372036854775807s"), Some(TimeSpec::Relative(-i64::MAX)));
        assert_eq!(parse_time("now+9223372036854775807d"), None);
        assert_eq!(parse_time("yesterday"), None);
    }
}

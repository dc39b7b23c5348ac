/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

/// Error returned when a duration does not fit the requested representation.
#[derive(Debug, Error)]
#[error("duration too large for u64 milliseconds")]
pub struct OverflowError;

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 3_600.0;
const SECS_PER_DAY: f64 = 86_400.0;

/// Builds a [Duration] from a possibly fractional number of seconds.
/// Negative and non-finite inputs saturate to a zero-length duration.
fn from_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs(0)
    }
}

/// A [Duration] of `n` nanoseconds, `n` possibly fractional.
pub fn nanos(n: f64) -> Duration {
    from_secs(n / 1e9)
}

/// A [Duration] of `n` microseconds, `n` possibly fractional.
pub fn micros(n: f64) -> Duration {
    from_secs(n / 1e6)
}

/// A [Duration] of `n` milliseconds, `n` possibly fractional.
pub fn millis(n: f64) -> Duration {
    from_secs(n / 1e3)
}

/// A [Duration] of `n` seconds, `n` possibly fractional.
pub fn seconds(n: f64) -> Duration {
    from_secs(n)
}

/// A [Duration] of `n` minutes, `n` possibly fractional.
pub fn minutes(n: f64) -> Duration {
    from_secs(n * SECS_PER_MINUTE)
}

/// A [Duration] of `n` hours, `n` possibly fractional.
pub fn hours(n: f64) -> Duration {
    from_secs(n * SECS_PER_HOUR)
}

/// A [Duration] of `n` days, `n` possibly fractional.
pub fn days(n: f64) -> Duration {
    from_secs(n * SECS_PER_DAY)
}

/// The period of an event occurring `n` times per second.
pub fn hz(n: f64) -> Duration {
    from_secs(1.0 / n)
}

/// The number of whole milliseconds in `duration`, or an error if the value
/// would overflow a `u64`.
pub fn to_millis(duration: Duration) -> Result<u64> {
    duration
        .as_millis()
        .try_into()
        .map_err(|_| OverflowError.into())
}

/// Renders a duration as its greatest-unit-first decomposition over days,
/// hours, minutes and seconds, e.g. `"1d 2h 3m 4s"`. Zero-length and
/// sub-second durations render as `"0s"`.
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = Vec::new();
    for (suffix, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        let count = secs / size;
        if count > 0 {
            out.push(format!("{}{}", count, suffix));
            secs -= count * size;
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    #[test]
    fn unit_conversions() {
        assert_eq!(nanos(1e6), Duration::from_millis(1));
        assert_eq!(micros(1e3), Duration::from_millis(1));
        assert_eq!(millis(1.0), Duration::from_millis(1));
        assert_eq!(seconds(1.5), Duration::from_millis(1_500));
        assert_eq!(minutes(2.0), Duration::from_secs(120));
        assert_eq!(hours(1.0), Duration::from_secs(3_600));
        assert_eq!(days(1.0), Duration::from_secs(86_400));
    }

    #[test]
    fn hz_is_a_period() {
        assert_eq!(hz(10.0), Duration::from_millis(100));
        assert_eq!(hz(0.5), Duration::from_secs(2));
    }

    #[test]
    fn negative_and_non_finite_saturate() {
        assert_eq!(seconds(-1.0), Duration::from_secs(0));
        assert_eq!(seconds(f64::NAN), Duration::from_secs(0));
        assert_eq!(hz(0.0), Duration::from_secs(0));
    }

    #[test]
    fn to_millis_checks_for_overflow() {
        assert_eq!(to_millis(Duration::from_millis(1_500)).unwrap(), 1_500);
        assert!(to_millis(Duration::from_secs(u64::MAX)).is_err());
    }

    #[test]
    fn format_zero() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_millis(999)), "0s");
    }

    #[test]
    fn format_decomposition() {
        assert_eq!(format_duration(Duration::from_secs(1)), "1s");
        assert_eq!(format_duration(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_duration(Duration::from_secs(3_600)), "1h");
        assert_eq!(
            format_duration(Duration::from_secs(86_400 + 2 * 3_600 + 3 * 60 + 4)),
            "1d 2h 3m 4s"
        );
    }

    quickcheck! {
        fn format_round_trips_seconds(secs: u32) -> bool {
            let rendered = format_duration(Duration::from_secs(secs as u64));
            let mut total = 0u64;
            for part in rendered.split(' ') {
                let (digits, suffix) = part.split_at(part.len() - 1);
                let count: u64 = digits.parse().unwrap();
                let size = match suffix {
                    "d" => 86_400,
                    "h" => 3_600,
                    "m" => 60,
                    "s" => 1,
                    _ => return false,
                };
                total += count * size;
            }
            total == secs as u64
        }
    }
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// A duration written the way the persisted `spec.ttl` field spells it:
/// a sequence of decimal numbers with unit suffixes, e.g. `"24h"`,
/// `"1h30m"`, `"720h0m0s"`, `"1.5h"`, `"90s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GoDuration(pub Duration);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct ParseDurationError {
    input: String,
    reason: &'static str,
}

impl GoDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_hours(hours: u64) -> Self {
        Self(Duration::from_secs(hours * 3600))
    }

    pub fn as_std(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

const NANOS_PER: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3600 * 1_000_000_000),
];

fn unit_nanos(unit: &str) -> Option<u128> {
    NANOS_PER.iter().find(|(u, _)| *u == unit).map(|(_, n)| *n)
}

impl FromStr for GoDuration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseDurationError {
            input: s.to_string(),
            reason,
        };
        let mut rest = s.strip_prefix('+').unwrap_or(s);
        if rest.starts_with('-') {
            return Err(err("negative durations are not allowed"));
        }
        if rest == "0" {
            return Ok(Self(Duration::ZERO));
        }
        if rest.is_empty() {
            return Err(err("empty"));
        }

        let mut total: u128 = 0;
        while !rest.is_empty() {
            let num_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            let (number, tail) = rest.split_at(num_len);
            if number.is_empty() || number == "." {
                return Err(err("expected a number"));
            }
            let unit_len = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_len);
            if unit.is_empty() {
                return Err(err("missing unit"));
            }
            let scale = unit_nanos(unit).ok_or_else(|| err("unknown unit"))?;

            let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
            if frac.contains('.') {
                return Err(err("malformed number"));
            }
            let whole: u128 = if whole.is_empty() {
                0
            } else {
                whole.parse().map_err(|_| err("malformed number"))?
            };
            let mut part = whole.checked_mul(scale).ok_or_else(|| err("overflow"))?;
            // Fractional digits beyond nanosecond resolution are dropped.
            let mut divisor: u128 = 1;
            for digit in frac.chars() {
                let d = digit.to_digit(10).ok_or_else(|| err("malformed number"))? as u128;
                divisor = divisor.saturating_mul(10);
                part += d * scale / divisor;
            }
            total = total.checked_add(part).ok_or_else(|| err("overflow"))?;
            rest = tail;
        }

        let secs = u64::try_from(total / 1_000_000_000).map_err(|_| err("overflow"))?;
        let nanos = (total % 1_000_000_000) as u32;
        Ok(Self(Duration::new(secs, nanos)))
    }
}

fn trim_fraction(value: u128, width: usize) -> String {
    let frac = format!("{value:0width$}");
    frac.trim_end_matches('0').to_string()
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }
        if nanos < 1_000_000_000 {
            let (scale, unit, width) = if nanos < 1_000 {
                (1, "ns", 0)
            } else if nanos < 1_000_000 {
                (1_000, "µs", 3)
            } else {
                (1_000_000, "ms", 6)
            };
            let whole = nanos / scale;
            let frac = nanos % scale;
            return if frac == 0 {
                write!(f, "{whole}{unit}")
            } else {
                write!(f, "{whole}.{}{unit}", trim_fraction(frac, width))
            };
        }

        let total_secs = self.0.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let secs = total_secs % 60;
        let sub = self.0.subsec_nanos();
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        if sub == 0 {
            write!(f, "{secs}s")
        } else {
            write!(f, "{secs}.{}s", trim_fraction(sub as u128, 9))
        }
    }
}

impl Serialize for GoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct GoDurationVisitor;

impl Visitor<'_> for GoDurationVisitor {
    type Value = GoDuration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration string such as \"24h\" or \"1h30m\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<GoDuration, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(GoDurationVisitor)
    }
}

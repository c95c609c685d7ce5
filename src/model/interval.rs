//! Bar-interval tag parsing (§4.2, §6.1). Unknown tags are fatal at
//! startup; valid tags are the minute multiples, the hour tag, and the
//! day/week/month/year tags listed in §6.1's `bar_intervals` config.

use std::fmt;

use chrono::{Datelike, IsoWeek, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Minute(u32),
    Hour(u32),
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Error)]
#[error("unknown bar interval tag: {0}")]
pub struct UnknownIntervalTag(pub String);

impl Interval {
    /// Parses a tag like `"1m"`, `"15m"`, `"1h"`, `"1d"`, `"1w"`, `"1M"`,
    /// `"1y"`. Case matters: lowercase `m` is minutes, uppercase `M` is
    /// months.
    pub fn parse(tag: &str) -> Result<Self, UnknownIntervalTag> {
        let err = || UnknownIntervalTag(tag.to_string());
        if tag.is_empty() {
            return Err(err());
        }
        let (num_part, suffix) = tag.split_at(tag.len() - 1);
        match suffix {
            "m" => {
                let n: u32 = num_part.parse().map_err(|_| err())?;
                if n == 0 {
                    return Err(err());
                }
                Ok(Self::Minute(n))
            }
            "h" => {
                let n: u32 = num_part.parse().map_err(|_| err())?;
                if n == 0 {
                    return Err(err());
                }
                Ok(Self::Hour(n))
            }
            "d" if num_part == "1" => Ok(Self::Day),
            "w" if num_part == "1" => Ok(Self::Week),
            "M" if num_part == "1" => Ok(Self::Month),
            "y" if num_part == "1" => Ok(Self::Year),
            _ => Err(err()),
        }
    }

    /// Canonical window length in minutes, day = 1440 per §4.2.
    pub fn window_minutes(self) -> i64 {
        match self {
            Self::Minute(n) => n as i64,
            Self::Hour(n) => n as i64 * 60,
            Self::Day => 1440,
            Self::Week => 1440 * 7,
            Self::Month => 1440 * 30,
            Self::Year => 1440 * 365,
        }
    }

    pub fn tag(self) -> String {
        match self {
            Self::Minute(n) => format!("{n}m"),
            Self::Hour(n) => format!("{n}h"),
            Self::Day => "1d".to_string(),
            Self::Week => "1w".to_string(),
            Self::Month => "1M".to_string(),
            Self::Year => "1y".to_string(),
        }
    }

    /// Whether two trading days fall in the same window for the
    /// day/week/month/year tags, which align on the trading-day calendar
    /// rather than on a minute slot (§4.2).
    pub fn same_calendar_bucket(self, a: NaiveDate, b: NaiveDate) -> bool {
        match self {
            Self::Day => a == b,
            Self::Week => iso_week(a) == iso_week(b),
            Self::Month => (a.year(), a.month()) == (b.year(), b.month()),
            Self::Year => a.year() == b.year(),
            Self::Minute(_) | Self::Hour(_) => a == b,
        }
    }
}

fn iso_week(d: NaiveDate) -> (i32, u32) {
    let w: IsoWeek = d.iso_week();
    (w.year(), w.week())
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

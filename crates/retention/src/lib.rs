#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `retention` implements the expression language that decides which
//! snapshots of a backup job to keep and which to delete. An expression is an
//! ordered list of age-tier rules such as `1d:4/d, 1w:1/d, 2m:none`, read as
//! "older than one day keep four per day, older than one week keep one per
//! day, older than two months keep none". A bare positive integer `N` is the
//! degenerate form "keep the `N` most recent snapshots".
//!
//! # Design
//!
//! [`RetentionExpression`] is the parsed, canonical form: rules sorted
//! ascending by tier age, each rule a [`Rule`] pairing an [`Age`] with a
//! [`Keep`] verdict. Parsing is exposed through [`str::parse`] and the
//! canonical text through [`Display`](std::fmt::Display); printing an
//! expression and parsing it back yields an equal value.
//!
//! Evaluation ([`RetentionExpression::select`]) is a pure function of the
//! snapshot set, the expression, and an explicit reference time. Per-interval
//! rules partition a tier by calendar bucket in UTC (hours on the hour, days
//! at midnight, weeks starting on ISO Monday, calendar months and years); a
//! multiplier such as `1/4m` fuses four consecutive buckets into one.
//!
//! # Invariants
//!
//! - The most recent snapshot of the input set is always kept, whatever the
//!   expression says. A job that dropped it would lose its only possible
//!   incremental parent.
//! - Snapshots younger than the first tier's age are always kept.
//! - Two rules may not share a tier age; the parser rejects duplicates.
//!
//! # Examples
//!
//! ```
//! use retention::{Keep, RetentionExpression};
//!
//! let expr: RetentionExpression = "1d:4/d, 1w:daily, 2m:none".parse()?;
//! assert_eq!(expr.to_string(), "1d:4/d, 1w:1/d, 2m:none");
//! assert_eq!(expr.rules().len(), 3);
//! assert_eq!(expr.rules()[2].keep, Keep::None);
//! # Ok::<(), retention::RetentionParseError>(())
//! ```

use std::fmt;
use std::str::FromStr;

use time::Duration;

mod evaluate;
mod parse;

pub use evaluate::Selection;
pub use parse::RetentionParseError;

/// Calendar interval used both as an age unit and as a keep bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interval {
    /// A clock hour, `[HH:00, HH+1:00)` UTC.
    Hour,
    /// A calendar day at UTC midnight boundaries.
    Day,
    /// An ISO week starting Monday 00:00 UTC.
    Week,
    /// A calendar month in UTC.
    Month,
    /// A calendar year in UTC.
    Year,
}

impl Interval {
    /// Nominal span of the interval, used for age-tier arithmetic.
    ///
    /// Months and years use the conventional 30- and 365-day approximations;
    /// calendar bucketing during evaluation is exact.
    #[must_use]
    pub const fn span(self) -> Duration {
        match self {
            Interval::Hour => Duration::hours(1),
            Interval::Day => Duration::days(1),
            Interval::Week => Duration::days(7),
            Interval::Month => Duration::days(30),
            Interval::Year => Duration::days(365),
        }
    }

    /// Single-letter symbol used in expression text.
    #[must_use]
    pub const fn symbol(self) -> char {
        match self {
            Interval::Hour => 'h',
            Interval::Day => 'd',
            Interval::Week => 'w',
            Interval::Month => 'm',
            Interval::Year => 'y',
        }
    }

    pub(crate) fn from_symbol(symbol: char) -> Option<Self> {
        match symbol.to_ascii_lowercase() {
            'h' => Some(Interval::Hour),
            'd' => Some(Interval::Day),
            'w' => Some(Interval::Week),
            'm' => Some(Interval::Month),
            'y' => Some(Interval::Year),
            _ => None,
        }
    }
}

/// Age threshold opening a tier: snapshots at least this old fall into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Age {
    /// Number of intervals.
    pub amount: u32,
    /// Interval unit. A plain number in expression text means hours.
    pub interval: Interval,
}

impl Age {
    /// The zero age, opening a tier that covers every snapshot.
    pub const ZERO: Age = Age {
        amount: 0,
        interval: Interval::Hour,
    };

    /// Age as a duration for tier comparison.
    #[must_use]
    pub fn duration(self) -> Duration {
        self.interval.span() * self.amount
    }
}

impl fmt::Display for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.interval.symbol())
    }
}

/// Keep verdict applied to the snapshots of one tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keep {
    /// Keep every snapshot in the tier.
    All,
    /// Keep none of them.
    None,
    /// Keep the `n` most recent snapshots of the tier, regardless of spacing.
    Newest(u32),
    /// Keep `count` snapshots per run of `multiplier` consecutive calendar
    /// buckets of `interval`.
    PerInterval {
        /// Snapshots kept per (super-)bucket.
        count: u32,
        /// Consecutive buckets fused into one; `1` for plain `n/unit`.
        multiplier: u32,
        /// Calendar bucket unit.
        interval: Interval,
    },
}

impl fmt::Display for Keep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Keep::All => f.write_str("all"),
            Keep::None => f.write_str("none"),
            Keep::Newest(count) => write!(f, "{count}"),
            Keep::PerInterval {
                count,
                multiplier: 1,
                interval,
            } => write!(f, "{count}/{}", interval.symbol()),
            Keep::PerInterval {
                count,
                multiplier,
                interval,
            } => write!(f, "{count}/{multiplier}{}", interval.symbol()),
        }
    }
}

/// One age-tier rule of a retention expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rule {
    /// Start of the tier; the tier extends to the next rule's age.
    pub age: Age,
    /// Verdict for snapshots inside the tier.
    pub keep: Keep,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.age, self.keep)
    }
}

/// A parsed retention expression: age-tier rules sorted ascending by age.
///
/// The last tier extends to infinity. Snapshots younger than the first tier's
/// age are outside every tier and are always kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionExpression {
    rules: Vec<Rule>,
}

impl RetentionExpression {
    pub(crate) fn from_rules(rules: Vec<Rule>) -> Self {
        debug_assert!(
            rules
                .windows(2)
                .all(|pair| pair[0].age.duration() < pair[1].age.duration()),
            "rules must be sorted by age and free of duplicates"
        );
        Self { rules }
    }

    /// The canonical rule list, ascending by tier age.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether this is the degenerate "keep the N most recent" form.
    #[must_use]
    pub fn as_plain_count(&self) -> Option<u32> {
        match self.rules.as_slice() {
            [Rule {
                age,
                keep: Keep::Newest(count),
            }] if age.duration().is_zero() => Some(*count),
            _ => None,
        }
    }
}

impl FromStr for RetentionExpression {
    type Err = RetentionParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        parse::parse(text)
    }
}

impl fmt::Display for RetentionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(count) = self.as_plain_count() {
            return write!(f, "{count}");
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_count_round_trips() {
        let expr: RetentionExpression = "3".parse().expect("valid expression");
        assert_eq!(expr.as_plain_count(), Some(3));
        assert_eq!(expr.to_string(), "3");
    }

    #[test]
    fn shorthands_canonicalise() {
        let expr: RetentionExpression = "1d:4/d, 1w:daily, 2m:none".parse().expect("valid");
        assert_eq!(expr.to_string(), "1d:4/d, 1w:1/d, 2m:none");
    }

    #[test]
    fn rules_sort_by_age() {
        let expr: RetentionExpression = "2m:none, 1d:all".parse().expect("valid");
        assert_eq!(
            expr.rules()[0],
            Rule {
                age: Age {
                    amount: 1,
                    interval: Interval::Day
                },
                keep: Keep::All,
            }
        );
        assert_eq!(expr.rules()[1].keep, Keep::None);
    }

    #[test]
    fn age_span_ordering() {
        assert!(Interval::Hour.span() < Interval::Day.span());
        assert!(Interval::Month.span() < Interval::Year.span());
    }
}

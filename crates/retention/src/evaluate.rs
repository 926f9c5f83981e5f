//! Applying an expression to a set of timestamped snapshots.

use std::cmp::Reverse;
use std::collections::HashMap;

use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::{Interval, Keep, RetentionExpression};

/// Partition of a snapshot set into survivors and casualties.
///
/// Both sides are ordered newest first.
#[derive(Debug)]
pub struct Selection<'a, T> {
    /// Snapshots the expression keeps.
    pub keep: Vec<&'a T>,
    /// Snapshots the expression drops.
    pub drop: Vec<&'a T>,
}

impl RetentionExpression {
    /// Partitions `items` into keep and drop sets at reference time `now`.
    ///
    /// Pure: equal inputs yield equal outputs. The newest item is always
    /// kept, as are items younger than the first tier's age.
    pub fn select<'a, T, F>(&self, items: &'a [T], now: OffsetDateTime, timestamp: F) -> Selection<'a, T>
    where
        F: Fn(&T) -> OffsetDateTime,
    {
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by_key(|&index| Reverse(timestamp(&items[index])));

        let mut kept = vec![false; items.len()];

        // Tier membership, newest first within each tier.
        let mut tiers: Vec<Vec<usize>> = vec![Vec::new(); self.rules().len()];
        for &index in &order {
            match self.tier_for(timestamp(&items[index]), now) {
                Some(tier) => tiers[tier].push(index),
                // Younger than the first tier: not governed by any rule.
                None => kept[index] = true,
            }
        }

        for (rule, members) in self.rules().iter().zip(&tiers) {
            match rule.keep {
                Keep::All => {
                    for &index in members {
                        kept[index] = true;
                    }
                }
                Keep::None => {}
                Keep::Newest(count) => {
                    for &index in members.iter().take(count as usize) {
                        kept[index] = true;
                    }
                }
                Keep::PerInterval {
                    count,
                    multiplier,
                    interval,
                } => {
                    let mut filled: HashMap<i64, u32> = HashMap::new();
                    for &index in members {
                        let bucket = bucket_index(interval, timestamp(&items[index]))
                            .div_euclid(i64::from(multiplier));
                        let occupancy = filled.entry(bucket).or_insert(0);
                        if *occupancy < count {
                            *occupancy += 1;
                            kept[index] = true;
                        }
                    }
                }
            }
        }

        // The newest snapshot survives unconditionally.
        if let Some(&newest) = order.first() {
            kept[newest] = true;
        }

        let mut selection = Selection {
            keep: Vec::new(),
            drop: Vec::new(),
        };
        for &index in &order {
            if kept[index] {
                selection.keep.push(&items[index]);
            } else {
                selection.drop.push(&items[index]);
            }
        }
        selection
    }

    /// Index of the tier a snapshot taken at `at` belongs to, or `None` when
    /// it is younger than every tier.
    ///
    /// Plain tiers admit a snapshot once its own age reaches the tier age. A
    /// per-interval tier admits whole calendar buckets: the snapshot enters
    /// only when the end of its bucket has aged past the threshold, so a
    /// bucket's survivor set can only shrink as the bucket drifts through
    /// the tiers.
    fn tier_for(&self, at: OffsetDateTime, now: OffsetDateTime) -> Option<usize> {
        let mut found = None;
        for (index, rule) in self.rules().iter().enumerate() {
            let threshold = rule.age.duration();
            let entered = match rule.keep {
                Keep::PerInterval { interval, .. } => now - bucket_end(interval, at) >= threshold,
                Keep::All | Keep::None | Keep::Newest(_) => now - at >= threshold,
            };
            if entered {
                found = Some(index);
            }
        }
        found
    }
}

/// Exclusive end of the calendar bucket containing `at`, in UTC.
fn bucket_end(interval: Interval, at: OffsetDateTime) -> OffsetDateTime {
    let at = at.to_offset(UtcOffset::UTC);
    let date = at.date();
    match interval {
        Interval::Hour => {
            at - Duration::seconds(at.unix_timestamp().rem_euclid(3600)) + Duration::hours(1)
        }
        Interval::Day => next_midnight(date),
        Interval::Week => {
            let days_left = 7 - i64::from(date.weekday().number_days_from_monday());
            next_midnight(date) + Duration::days(days_left - 1)
        }
        Interval::Month => {
            let (year, month) = match date.month() {
                time::Month::December => (date.year() + 1, time::Month::January),
                month => (date.year(), month.next()),
            };
            Date::from_calendar_date(year, month, 1)
                .expect("first of month is valid")
                .midnight()
                .assume_utc()
        }
        Interval::Year => Date::from_calendar_date(date.year() + 1, time::Month::January, 1)
            .expect("first of january is valid")
            .midnight()
            .assume_utc(),
    }
}

fn next_midnight(date: Date) -> OffsetDateTime {
    date.midnight().assume_utc() + Duration::days(1)
}

/// Absolute calendar bucket index in UTC.
///
/// Consecutive buckets of one interval map to consecutive integers, so a
/// multiplier of `k` fuses buckets by integer division.
fn bucket_index(interval: Interval, at: OffsetDateTime) -> i64 {
    let at = at.to_offset(UtcOffset::UTC);
    match interval {
        Interval::Hour => at.unix_timestamp().div_euclid(3600),
        Interval::Day => i64::from(at.date().to_julian_day()),
        Interval::Week => {
            let julian = i64::from(at.date().to_julian_day());
            let monday = julian - i64::from(at.date().weekday().number_days_from_monday());
            monday.div_euclid(7)
        }
        Interval::Month => i64::from(at.year()) * 12 + i64::from(u8::from(at.month())) - 1,
        Interval::Year => i64::from(at.year()),
    }
}

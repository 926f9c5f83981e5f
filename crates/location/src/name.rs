//! The snapshot name codec.
//!
//! A managed snapshot is named `sx-YYYYMMDD-hhmmss-utc`, its creation instant
//! at second resolution in UTC. The encoding preserves total order under
//! plain string comparison, which is what makes "latest common snapshot"
//! a byte-wise question. Anything that does not match the pattern exactly is
//! not a managed snapshot and is left alone.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const NAME_FORMAT: &[FormatItem<'static>] =
    format_description!("sx-[year][month][day]-[hour][minute][second]-utc");

const LOCAL_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory]:[offset_minute]"
);

/// A name that is not a managed snapshot name.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("`{name}` is not a managed snapshot name")]
pub struct NameError {
    /// The rejected name.
    pub name: String,
}

/// A snapshot identity: a UTC instant at second resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotName {
    timestamp: OffsetDateTime,
}

impl SnapshotName {
    /// The name for a snapshot taken at `instant`.
    ///
    /// Sub-second precision is discarded; names resolve to whole seconds.
    #[must_use]
    pub fn at(instant: OffsetDateTime) -> Self {
        let utc = instant.to_offset(UtcOffset::UTC);
        Self {
            timestamp: utc.replace_nanosecond(0).unwrap_or(utc),
        }
    }

    /// The instant this name encodes.
    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// The timestamp rendered in the given local offset, for display next to
    /// the canonical UTC name.
    #[must_use]
    pub fn localised(&self, offset: UtcOffset) -> String {
        self.timestamp
            .to_offset(offset)
            .format(LOCAL_FORMAT)
            .unwrap_or_else(|_| self.to_string())
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.timestamp.format(NAME_FORMAT).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl FromStr for SnapshotName {
    type Err = NameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let parsed = PrimitiveDateTime::parse(name, NAME_FORMAT).map_err(|_| NameError {
            name: name.to_string(),
        })?;
        Ok(Self {
            timestamp: parsed.assume_utc(),
        })
    }
}

/// The most recent name present in both inventories.
///
/// Sameness is name equality alone; contents are never compared. This is the
/// synchronisation contract between the two sides of a job.
#[must_use]
pub fn latest_common(ours: &[SnapshotName], theirs: &[SnapshotName]) -> Option<SnapshotName> {
    ours.iter()
        .filter(|name| theirs.contains(name))
        .max()
        .copied()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn encodes_utc_at_second_resolution() {
        let name = SnapshotName::at(datetime!(2024-01-01 03:00:00.75 UTC));
        assert_eq!(name.to_string(), "sx-20240101-030000-utc");
    }

    #[test]
    fn encodes_after_converting_to_utc() {
        let name = SnapshotName::at(datetime!(2024-01-01 03:00:00 +02:00));
        assert_eq!(name.to_string(), "sx-20240101-010000-utc");
    }

    #[test]
    fn parses_back_to_the_same_instant() {
        let instant = datetime!(2022-11-05 23:59:59 UTC);
        let name = SnapshotName::at(instant);
        let reparsed: SnapshotName = name.to_string().parse().expect("name parses");
        assert_eq!(reparsed.timestamp(), instant);
    }

    #[test]
    fn rejects_foreign_names() {
        for name in [
            "",
            "home",
            "sx-2024010-030000-utc",
            "sx-20240101-030000",
            "sx-20240101-030000-utcx",
            "snapshot-20240101-030000-utc",
            "sx-20241301-030000-utc",
        ] {
            assert!(name.parse::<SnapshotName>().is_err(), "`{name}` accepted");
        }
    }

    #[test]
    fn lexicographic_order_matches_timestamp_order() {
        let older = SnapshotName::at(datetime!(2023-12-31 23:59:59 UTC));
        let newer = SnapshotName::at(datetime!(2024-01-01 00:00:00 UTC));
        assert!(older < newer);
        assert!(older.to_string() < newer.to_string());
    }

    #[test]
    fn latest_common_picks_the_newest_shared_name() {
        let a = SnapshotName::at(datetime!(2024-01-01 00:00:00 UTC));
        let b = SnapshotName::at(datetime!(2024-01-02 00:00:00 UTC));
        let c = SnapshotName::at(datetime!(2024-01-03 00:00:00 UTC));

        assert_eq!(latest_common(&[a, b, c], &[a, b]), Some(b));
        assert_eq!(latest_common(&[a, b], &[c]), None);
        assert_eq!(latest_common(&[], &[a]), None);
    }

    mod properties {
        use proptest::prelude::*;
        use time::Duration;
        use time::macros::datetime;

        use super::*;

        proptest! {
            #[test]
            fn order_is_preserved_by_the_encoding(
                left in 0i64..4_000_000_000,
                right in 0i64..4_000_000_000,
            ) {
                let base = datetime!(1970-01-01 00:00:00 UTC);
                let a = SnapshotName::at(base + Duration::seconds(left));
                let b = SnapshotName::at(base + Duration::seconds(right));
                prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
            }

            #[test]
            fn encoding_round_trips(seconds in 0i64..4_000_000_000) {
                let base = datetime!(1970-01-01 00:00:00 UTC);
                let name = SnapshotName::at(base + Duration::seconds(seconds));
                let reparsed: SnapshotName =
                    name.to_string().parse().expect("canonical name parses");
                prop_assert_eq!(reparsed, name);
            }
        }
    }
}

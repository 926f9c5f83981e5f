#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `location` is everything a backup job persists at one of its two sides:
//! the timestamped snapshots inside a container subvolume, and the job
//! descriptor file describing the pairing. [`SnapshotName`] is the strict
//! `sx-YYYYMMDD-hhmmss-utc` codec whose lexicographic order matches timestamp
//! order; [`SnapshotStore`] enumerates, creates and deletes snapshots through
//! an [`Endpoint`](endpoint::Endpoint); [`JobDescriptor`] is the INI document
//! stored as `.btrfs-sxbackup` inside each container.

mod descriptor;
mod name;
mod store;

pub use descriptor::{DescriptorError, JobDescriptor, DESCRIPTOR_FILENAME, FORMAT_VERSION};
pub use name::{latest_common, NameError, SnapshotName};
pub use store::{SnapshotStore, StoreError};

/// Default container subvolume name, directly below the source subvolume.
pub const DEFAULT_CONTAINER: &str = ".sxbackup";

/// Container name written by historical versions of the tool.
pub const LEGACY_CONTAINER: &str = "sxbackup";

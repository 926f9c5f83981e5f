#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `job` drives a backup job over its `(source, destination)` pair: create a
//! read-only snapshot of the source subvolume, stream the incremental delta
//! to the destination container, apply each side's retention expression, and
//! keep the descriptor copies on both sides in sync. The commands mirror the
//! CLI surface: [`Job::init`], [`Job::run`], [`Job::update`], [`Job::info`],
//! [`Job::purge`], [`Job::destroy`] and the job-less [`transfer_subvolume`].
//!
//! # Design
//!
//! Endpoints are reached through a [`Connector`] and the clock through
//! [`Clock`], so the orchestration scenarios run against an in-memory
//! endpoint pair with a pinned clock (see [`test_utils`]). Within one run the
//! side effects are strictly ordered: snapshot, then transfer, then
//! retention, then the descriptor write. A failed transfer removes the
//! freshly created source snapshot so the destination keeps its pre-run
//! snapshot set.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use time::UtcOffset;
use tracing::{info, warn};

use endpoint::{Endpoint, EndpointSpec, EndpointUrl, Interrupt};
use location::{
    latest_common, JobDescriptor, SnapshotName, SnapshotStore, StoreError, DEFAULT_CONTAINER,
    DESCRIPTOR_FILENAME, LEGACY_CONTAINER,
};
use retention::RetentionExpression;

mod clock;
mod error;
pub mod test_utils;
mod transfer;

pub use clock::{Clock, SystemClock};
pub use error::JobError;
pub use transfer::transfer_subvolume;

/// Source retention applied when `init` is given none.
pub const DEFAULT_SOURCE_RETENTION: &str = "3";

/// Destination retention applied when `init` is given none.
pub const DEFAULT_DESTINATION_RETENTION: &str = "2d:1/d, 2w:3/w, 1m:1/w, 2m:none";

const COLLISION_RETRIES: u32 = 3;
const COLLISION_PAUSE: Duration = Duration::from_secs(1);

/// Resolves a location URL to a concrete endpoint.
pub trait Connector {
    /// The endpoint commands against this URL should run on.
    fn connect(&self, url: &EndpointUrl) -> Arc<dyn Endpoint>;
}

/// The production connector: local processes and `ssh`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn connect(&self, url: &EndpointUrl) -> Arc<dyn Endpoint> {
        endpoint::connect(url)
    }
}

/// Which half of the pair a location plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Source,
    Destination,
}

impl Role {
    fn noun(self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Destination => "destination",
        }
    }
}

/// One side of a job: a location plus its snapshot store.
struct Side {
    role: Role,
    url: EndpointUrl,
    endpoint: Arc<dyn Endpoint>,
    store: SnapshotStore,
}

impl Side {
    fn new(role: Role, url: EndpointUrl, endpoint: Arc<dyn Endpoint>, container: PathBuf) -> Self {
        let store = SnapshotStore::new(endpoint.clone(), container);
        Self {
            role,
            url,
            endpoint,
            store,
        }
    }

    fn descriptor_path(&self) -> PathBuf {
        self.store.container().join(DESCRIPTOR_FILENAME)
    }

    fn describe(&self) -> String {
        format!("{} `{}`", self.role.noun(), self.url)
    }
}

/// Parameters for [`Job::init`].
pub struct InitOptions {
    /// URL of the subvolume to protect.
    pub source: EndpointUrl,
    /// URL of the container receiving snapshot copies.
    pub destination: EndpointUrl,
    /// Source retention; defaults to [`DEFAULT_SOURCE_RETENTION`].
    pub source_retention: Option<RetentionExpression>,
    /// Destination retention; defaults to [`DEFAULT_DESTINATION_RETENTION`].
    pub destination_retention: Option<RetentionExpression>,
    /// Whether transfers compress the stream in flight.
    pub compress: bool,
}

/// Parameters for [`Job::update`]; `None` leaves a field untouched.
#[derive(Default)]
pub struct UpdateOptions {
    /// New source retention.
    pub source_retention: Option<RetentionExpression>,
    /// New destination retention.
    pub destination_retention: Option<RetentionExpression>,
    /// New compression setting; `None` keeps the current one.
    pub compress: Option<bool>,
}

/// Non-persisted retention overrides for [`Job::purge`].
#[derive(Default)]
pub struct PurgeOptions {
    /// Override for the source expression.
    pub source_retention: Option<RetentionExpression>,
    /// Override for the destination expression.
    pub destination_retention: Option<RetentionExpression>,
}

/// A loaded backup job: both sides plus the authoritative descriptor.
pub struct Job {
    source: Side,
    destination: Side,
    descriptor: JobDescriptor,
    addressed: Role,
    other_descriptor: Option<JobDescriptor>,
    other_unreachable: bool,
    mismatch: bool,
}

impl Job {
    /// Initializes a new job: validates both locations, creates the container
    /// subvolumes, and writes a descriptor on each side. No snapshot is
    /// taken.
    pub fn init(connector: &dyn Connector, options: InitOptions) -> Result<Self, JobError> {
        if !options.source.path().is_absolute() {
            return Err(JobError::Config(format!(
                "source path `{}` must be absolute",
                options.source.path().display()
            )));
        }
        if !options.destination.path().is_absolute() {
            return Err(JobError::Config(format!(
                "destination path `{}` must be absolute",
                options.destination.path().display()
            )));
        }

        let source_endpoint = connector.connect(&options.source);
        let destination_endpoint = connector.connect(&options.destination);

        if !source_endpoint.dir_exists(options.source.path())? {
            return Err(JobError::Config(format!(
                "source subvolume `{}` does not exist",
                options.source
            )));
        }

        let source = Side::new(
            Role::Source,
            options.source.clone(),
            source_endpoint,
            options.source.path().join(DEFAULT_CONTAINER),
        );
        let destination = Side::new(
            Role::Destination,
            options.destination.clone(),
            destination_endpoint,
            options.destination.path().to_path_buf(),
        );

        for side in [&source, &destination] {
            if side.endpoint.file_exists(&side.descriptor_path())? {
                return Err(JobError::Config(format!(
                    "{} is already initialized",
                    side.describe()
                )));
            }
        }

        source.store.ensure_container()?;
        destination.store.ensure_container()?;

        let descriptor = JobDescriptor::new(
            Some(options.source),
            Some(options.destination),
            PathBuf::from(DEFAULT_CONTAINER),
            match options.source_retention {
                Some(expression) => expression,
                None => default_retention(DEFAULT_SOURCE_RETENTION),
            },
            match options.destination_retention {
                Some(expression) => expression,
                None => default_retention(DEFAULT_DESTINATION_RETENTION),
            },
            options.compress,
        );

        let mut job = Self {
            source,
            destination,
            descriptor,
            addressed: Role::Source,
            other_descriptor: None,
            other_unreachable: false,
            mismatch: false,
        };
        job.write_descriptors()?;
        job.other_descriptor = Some(job.descriptor.clone());
        info!(source = %job.source.url, destination = %job.destination.url, "job initialized");
        Ok(job)
    }

    /// Loads a job from either of its sides.
    ///
    /// The descriptor of the addressed side is authoritative. The other
    /// side's copy is read for cross-checking when reachable; `run` insists
    /// on it, `destroy` and `info` work without it.
    pub fn load(connector: &dyn Connector, url: &EndpointUrl) -> Result<Self, JobError> {
        let endpoint = connector.connect(url);

        let (role, container) = locate_descriptor(endpoint.as_ref(), url)?;
        let descriptor_path = container.join(DESCRIPTOR_FILENAME);
        let mut descriptor = JobDescriptor::load(endpoint.as_ref(), &descriptor_path)?;

        let (source, destination) = match role {
            Role::Source => {
                // Trust the container the descriptor was actually found in;
                // historical jobs used a different name.
                let relative = container
                    .strip_prefix(url.path())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| container.clone());
                descriptor.source_container = relative;
                descriptor.source = Some(url.clone());

                let destination_url =
                    descriptor.destination.clone().ok_or_else(|| {
                        JobError::Config(format!(
                            "descriptor at `{url}` does not identify a destination"
                        ))
                    })?;
                let source = Side::new(Role::Source, url.clone(), endpoint, container);
                let destination = Side::new(
                    Role::Destination,
                    destination_url.clone(),
                    connector.connect(&destination_url),
                    destination_url.path().to_path_buf(),
                );
                (source, destination)
            }
            Role::Destination => {
                descriptor.destination = Some(url.clone());
                let source_url = descriptor.source.clone().ok_or_else(|| {
                    JobError::Config(format!(
                        "descriptor at `{url}` does not identify the source side; \
                         address the job through its source"
                    ))
                })?;
                let source_container =
                    resolve_container(source_url.path(), &descriptor.source_container);
                let source = Side::new(
                    Role::Source,
                    source_url.clone(),
                    connector.connect(&source_url),
                    source_container,
                );
                let destination = Side::new(Role::Destination, url.clone(), endpoint, container);
                (source, destination)
            }
        };

        let other = match role {
            Role::Source => &destination,
            Role::Destination => &source,
        };
        let (other_descriptor, other_unreachable) = match read_other_descriptor(other) {
            Ok(found) => (found, false),
            Err(error) => {
                warn!(side = %other.describe(), %error, "could not read the peer descriptor");
                (None, true)
            }
        };

        let mismatch = other_descriptor.as_ref().is_some_and(|peer| {
            peer.source_retention != descriptor.source_retention
                || peer.destination_retention != descriptor.destination_retention
                || peer.compress != descriptor.compress
        });
        if mismatch {
            warn!("descriptor copies disagree between the two sides");
        }

        Ok(Self {
            source,
            destination,
            descriptor,
            addressed: role,
            other_descriptor,
            other_unreachable,
            mismatch,
        })
    }

    /// Performs one backup run at the clock's current time.
    ///
    /// Returns the name of the snapshot that now exists on both sides.
    pub fn run(&mut self, clock: &dyn Clock, interrupt: &Interrupt) -> Result<SnapshotName, JobError> {
        self.require_peer()?;
        if self.mismatch {
            return Err(JobError::Config(
                "the two descriptor copies disagree; run `update` to re-synchronise them"
                    .to_string(),
            ));
        }

        self.source.store.ensure_container()?;
        self.destination.store.ensure_container()?;

        let source_list = self.source.store.list()?;
        let destination_list = self.destination.store.list()?;
        check_interrupt(interrupt)?;

        let now = clock.now();
        let prospective = SnapshotName::at(now);
        if let Some(newest) = source_list.last() {
            if prospective <= *newest {
                return Err(JobError::Config(format!(
                    "refusing to snapshot: `{prospective}` would not be newer than the existing \
                     `{newest}`, which may indicate a system time problem"
                )));
            }
        }

        let parent = latest_common(&source_list, &destination_list);
        match parent {
            Some(parent) => {
                info!(parent = %parent, "incremental transfer");
            }
            None if destination_list.is_empty() => {
                info!("destination is empty, full transfer");
            }
            None => {
                warn!(
                    "source and destination share no snapshot; falling back to a full transfer"
                );
            }
        }

        let new_name = self.create_with_retry(clock)?;

        if let Err(error) = transfer::run_transfer(
            &self.source.store,
            &self.destination.store,
            parent.as_ref(),
            &new_name,
            self.descriptor.compress,
            interrupt,
        ) {
            self.discard_after_failed_transfer(&new_name);
            return Err(error);
        }
        check_interrupt(interrupt)?;

        // Retention runs with the new snapshot in both inventories; the
        // most-recent floor keeps it on each side.
        let source_list = with_name(source_list, new_name);
        let destination_list = with_name(destination_list, new_name);
        self.apply_retention(&self.source, &self.descriptor.source_retention, &source_list, now)?;
        self.apply_retention(
            &self.destination,
            &self.descriptor.destination_retention,
            &destination_list,
            now,
        )?;
        check_interrupt(interrupt)?;

        self.write_descriptors()?;
        info!(snapshot = %new_name, "backup run complete");
        Ok(new_name)
    }

    /// Rewrites the retention and compression settings on both sides.
    ///
    /// Absent options leave the stored values untouched; compression in
    /// particular is tri-state and never changes unless asked to.
    pub fn update(&mut self, options: UpdateOptions) -> Result<(), JobError> {
        if let Some(expression) = options.source_retention {
            self.descriptor.source_retention = expression;
        }
        if let Some(expression) = options.destination_retention {
            self.descriptor.destination_retention = expression;
        }
        if let Some(compress) = options.compress {
            self.descriptor.compress = compress;
        }
        self.write_descriptors()?;
        info!("job updated");
        Ok(())
    }

    /// Renders the job configuration and both snapshot inventories.
    ///
    /// Read-only; sides that cannot be listed render as unavailable.
    pub fn info(&self, out: &mut dyn Write, local_offset: UtcOffset) -> Result<(), JobError> {
        let mut fields: Vec<(String, Vec<String>)> = Vec::new();
        fields.push(("Source URL".to_string(), vec![self.source.url.to_string()]));
        fields.push((
            "Source container".to_string(),
            vec![self.descriptor.source_container.display().to_string()],
        ));
        fields.push((
            "Source retention".to_string(),
            vec![self.descriptor.source_retention.to_string()],
        ));
        fields.push((
            "Source snapshots".to_string(),
            render_inventory(&self.source, local_offset),
        ));
        fields.push((
            "Destination URL".to_string(),
            vec![self.destination.url.to_string()],
        ));
        fields.push((
            "Destination retention".to_string(),
            vec![self.descriptor.destination_retention.to_string()],
        ));
        fields.push((
            "Destination snapshots".to_string(),
            render_inventory(&self.destination, local_offset),
        ));
        fields.push(("Compress".to_string(), vec![self.descriptor.compress.to_string()]));

        let width = fields.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        for (label, values) in fields {
            let mut first = true;
            for value in values {
                if first {
                    writeln!(out, "   {label:<width$} {value}")?;
                } else {
                    writeln!(out, "   {:<width$} {value}", "")?;
                }
                first = false;
            }
        }
        Ok(())
    }

    /// Applies retention on both sides without taking a snapshot.
    ///
    /// Overrides are used for this invocation only and never persisted.
    pub fn purge(&self, clock: &dyn Clock, options: PurgeOptions) -> Result<(), JobError> {
        let now = clock.now();
        let source_expression = options
            .source_retention
            .as_ref()
            .unwrap_or(&self.descriptor.source_retention);
        let destination_expression = options
            .destination_retention
            .as_ref()
            .unwrap_or(&self.descriptor.destination_retention);

        let source_list = self.source.store.list()?;
        self.apply_retention(&self.source, source_expression, &source_list, now)?;

        let destination_list = self.destination.store.list()?;
        self.apply_retention(
            &self.destination,
            destination_expression,
            &destination_list,
            now,
        )?;
        Ok(())
    }

    /// Removes the job descriptors; with `purge` also every managed snapshot.
    ///
    /// Failures on the side the command was not addressed to are reported
    /// and skipped so local cleanup always completes.
    pub fn destroy(&self, purge: bool) -> Result<(), JobError> {
        let (addressed, other) = match self.addressed {
            Role::Source => (&self.source, &self.destination),
            Role::Destination => (&self.destination, &self.source),
        };

        if let Err(error) = destroy_side(other, purge) {
            warn!(side = %other.describe(), %error, "skipping cleanup on the far side");
        }
        destroy_side(addressed, purge)?;
        info!("job destroyed");
        Ok(())
    }

    /// The URL of the source subvolume.
    #[must_use]
    pub fn source_url(&self) -> &EndpointUrl {
        &self.source.url
    }

    /// The URL of the destination container.
    #[must_use]
    pub fn destination_url(&self) -> &EndpointUrl {
        &self.destination.url
    }

    fn require_peer(&self) -> Result<(), JobError> {
        if self.other_descriptor.is_some() {
            return Ok(());
        }
        let other = match self.addressed {
            Role::Source => &self.destination,
            Role::Destination => &self.source,
        };
        if self.other_unreachable {
            Err(JobError::Config(format!(
                "could not read the descriptor on {}",
                other.describe()
            )))
        } else {
            Err(JobError::Config(format!(
                "{} is not initialized; run `init` first",
                other.describe()
            )))
        }
    }

    fn create_with_retry(&self, clock: &dyn Clock) -> Result<SnapshotName, JobError> {
        let mut attempt = 0;
        loop {
            match self
                .source
                .store
                .create(self.source.url.path(), clock.now())
            {
                Err(StoreError::NameCollision { name, .. }) if attempt < COLLISION_RETRIES => {
                    attempt += 1;
                    warn!(snapshot = %name, attempt, "snapshot name taken, retrying");
                    clock.pause(COLLISION_PAUSE);
                }
                other => return Ok(other?),
            }
        }
    }

    fn discard_after_failed_transfer(&self, name: &SnapshotName) {
        if let Err(error) = self.source.store.delete(name) {
            warn!(snapshot = %name, %error, "could not remove the orphan source snapshot");
        }
        // The receiver may have left a partially received subvolume behind.
        if let Err(error) = self.destination.store.delete(name) {
            warn!(snapshot = %name, %error, "could not remove the partial destination snapshot");
        }
    }

    fn apply_retention(
        &self,
        side: &Side,
        expression: &RetentionExpression,
        inventory: &[SnapshotName],
        now: time::OffsetDateTime,
    ) -> Result<(), JobError> {
        let selection = expression.select(inventory, now, SnapshotName::timestamp);
        if selection.drop.is_empty() {
            return Ok(());
        }
        info!(
            side = side.role.noun(),
            expression = %expression,
            dropped = selection.drop.len(),
            kept = selection.keep.len(),
            "applying retention"
        );
        for name in selection.drop {
            side.store.delete(name)?;
        }
        Ok(())
    }

    fn write_descriptors(&self) -> Result<(), JobError> {
        for side in [&self.source, &self.destination] {
            let mut copy = self.descriptor.clone();
            copy.source = self
                .descriptor
                .source
                .clone()
                .filter(|url| addressable(url, side));
            copy.destination = self
                .descriptor
                .destination
                .clone()
                .filter(|url| addressable(url, side));
            copy.store(side.endpoint.as_ref(), &side.descriptor_path())?;
        }
        Ok(())
    }
}

/// Whether `url` can be dialled from the host `reader` lives on.
///
/// Remote URLs always can; a local URL only means something to another
/// process on the local host.
fn addressable(url: &EndpointUrl, reader: &Side) -> bool {
    match url.spec() {
        EndpointSpec::Remote { .. } => true,
        EndpointSpec::Local => reader.endpoint.host_identity().is_none(),
    }
}

/// Finds which side of a job `url` addresses by locating its descriptor.
fn locate_descriptor(
    endpoint: &dyn Endpoint,
    url: &EndpointUrl,
) -> Result<(Role, PathBuf), JobError> {
    for container in [DEFAULT_CONTAINER, LEGACY_CONTAINER] {
        let candidate = url.path().join(container);
        if endpoint.file_exists(&candidate.join(DESCRIPTOR_FILENAME))? {
            return Ok((Role::Source, candidate));
        }
    }
    if endpoint.file_exists(&url.path().join(DESCRIPTOR_FILENAME))? {
        return Ok((Role::Destination, url.path().to_path_buf()));
    }
    Err(JobError::Config(format!(
        "`{url}` is not an initialized backup location; run `init` first"
    )))
}

fn read_other_descriptor(side: &Side) -> Result<Option<JobDescriptor>, JobError> {
    let path = side.descriptor_path();
    if !side.endpoint.file_exists(&path)? {
        return Ok(None);
    }
    Ok(Some(JobDescriptor::load(side.endpoint.as_ref(), &path)?))
}

fn destroy_side(side: &Side, purge: bool) -> Result<(), JobError> {
    if purge {
        for name in side.store.list()? {
            side.store.delete(&name)?;
        }
    }
    side.endpoint.remove_file(&side.descriptor_path())?;

    if side.role == Role::Source && side.store.list().map(|list| list.is_empty()).unwrap_or(false)
    {
        if let Err(error) = side.store.remove_container() {
            warn!(%error, "leaving the source container in place");
        }
    }
    Ok(())
}

fn resolve_container(base: &Path, container: &Path) -> PathBuf {
    if container.is_absolute() {
        container.to_path_buf()
    } else {
        base.join(container)
    }
}

fn with_name(mut list: Vec<SnapshotName>, name: SnapshotName) -> Vec<SnapshotName> {
    list.push(name);
    list.sort_unstable();
    list
}

fn render_inventory(side: &Side, local_offset: UtcOffset) -> Vec<String> {
    match side.store.list() {
        Ok(names) if names.is_empty() => vec!["(none)".to_string()],
        Ok(names) => names
            .iter()
            .rev()
            .map(|name| format!("{name} ({})", name.localised(local_offset)))
            .collect(),
        Err(error) => {
            warn!(side = %side.describe(), %error, "could not list snapshots");
            vec!["(unavailable)".to_string()]
        }
    }
}

fn check_interrupt(interrupt: &Interrupt) -> Result<(), JobError> {
    if interrupt.is_raised() {
        return Err(JobError::Interrupted);
    }
    Ok(())
}

fn default_retention(text: &str) -> RetentionExpression {
    text.parse().expect("built-in retention expression parses")
}

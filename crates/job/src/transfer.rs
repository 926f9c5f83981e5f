//! Assembling the send/receive stream between the two sides.

use std::sync::Arc;

use tracing::{debug, info};

use endpoint::pipeline::Pipeline;
use endpoint::{CommandLine, Endpoint, EndpointUrl, Interrupt};
use location::{SnapshotName, SnapshotStore};

use crate::{Connector, JobError};

/// Streams one snapshot from the source store into the destination store.
///
/// Stage order on the producing side is send, then the progress meter when
/// one is installed, then the compressor; the decompressor and the receiver
/// run on the consuming side. The pipeline runner collapses all of it into a
/// single local pipeline when both sides share a host.
pub(crate) fn run_transfer(
    source: &SnapshotStore,
    destination: &SnapshotStore,
    parent: Option<&SnapshotName>,
    name: &SnapshotName,
    compress: bool,
    interrupt: &Interrupt,
) -> Result<(), JobError> {
    let target = destination.snapshot_path(name);
    if destination.endpoint().dir_exists(&target)? {
        return Err(JobError::Config(format!(
            "destination already holds a snapshot named `{name}`"
        )));
    }

    info!(
        snapshot = %name,
        incremental = parent.is_some(),
        compress,
        "transferring snapshot"
    );
    stream(
        source.endpoint(),
        destination.endpoint(),
        source.send_command(parent, name),
        destination.receive_command(),
        compress,
        interrupt,
    )
}

/// Sends an arbitrary read-only subvolume into a destination directory,
/// outside of any job. Always a full stream.
pub fn transfer_subvolume(
    connector: &dyn Connector,
    source: &EndpointUrl,
    destination: &EndpointUrl,
    compress: bool,
    interrupt: &Interrupt,
) -> Result<(), JobError> {
    let source_endpoint = connector.connect(source);
    let destination_endpoint = connector.connect(destination);

    let Some(basename) = source.path().file_name() else {
        return Err(JobError::Config(format!(
            "source `{source}` has no base name to receive under"
        )));
    };
    if !source_endpoint.dir_exists(source.path())? {
        return Err(JobError::Config(format!(
            "source subvolume `{source}` does not exist"
        )));
    }
    let target = destination.path().join(basename);
    if destination_endpoint.dir_exists(&target)? {
        return Err(JobError::Config(format!(
            "destination path `{}` already exists",
            target.display()
        )));
    }

    info!(source = %source, destination = %destination, "transferring subvolume");
    stream(
        &source_endpoint,
        &destination_endpoint,
        CommandLine::new("btrfs")
            .arg("send")
            .arg(source.path().to_string_lossy()),
        CommandLine::new("btrfs")
            .arg("receive")
            .arg(destination.path().to_string_lossy()),
        compress,
        interrupt,
    )
}

fn stream(
    source: &Arc<dyn Endpoint>,
    destination: &Arc<dyn Endpoint>,
    send: CommandLine,
    receive: CommandLine,
    compress: bool,
    interrupt: &Interrupt,
) -> Result<(), JobError> {
    let mut pipeline = Pipeline::new().stage(source.clone(), send);
    if progress_meter_available(source.as_ref()) {
        pipeline = pipeline.stage(source.clone(), CommandLine::new("pv"));
    }
    if compress {
        pipeline = pipeline.stage(source.clone(), CommandLine::new("lzop").arg("-c"));
        pipeline = pipeline.stage(destination.clone(), CommandLine::new("lzop").arg("-d"));
    }
    pipeline = pipeline.stage(destination.clone(), receive);

    pipeline.run(interrupt)?;
    Ok(())
}

/// Whether `pv` exists on the producing side. Its absence never fails a
/// transfer; the bytes just flow unobserved.
fn progress_meter_available(endpoint: &dyn Endpoint) -> bool {
    let probe = CommandLine::new("sh")
        .arg("-c")
        .arg("command -v pv >/dev/null 2>&1");
    match endpoint.probe(&probe) {
        Ok(code) => code == 0,
        Err(error) => {
            debug!(%error, "progress meter probe failed");
            false
        }
    }
}

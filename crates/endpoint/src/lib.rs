#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `endpoint` abstracts the execution site of privileged filesystem commands:
//! the local host, or a remote host reached through `ssh`. Every command a
//! backup job issues (snapshot creation, subvolume listing, descriptor file
//! reads and writes, the send/receive stream itself) goes through the
//! [`Endpoint`] trait so the orchestrator neither knows nor cares where a
//! side of the job lives, and so tests can substitute an in-memory fake.
//!
//! # Design
//!
//! [`LocalEndpoint`] runs commands as child processes with piped stdio.
//! [`RemoteEndpoint`] renders the argument vector into a single quoted shell
//! word sequence and hands it to `ssh`; the remote login shell re-parses it,
//! which is why [`shell::quote_word`] must be exact. Two endpoints compare as
//! "the same host" when both are local or both name the same `(host, port)`
//! pair; the user is deliberately excluded so `root@nas` and `backup@nas`
//! collapse into one pipeline.
//!
//! The [`pipeline`] module composes commands living on up to two endpoints
//! into one streamed run: stages on one host are wired kernel-side or joined
//! into a single remote shell pipeline (one SSH channel per remote side), and
//! a pump thread couples the two sides.
//!
//! # Errors
//!
//! Command failures surface as [`EndpointError`] carrying the endpoint
//! label, the rendered command, the exit code and a bounded stderr tail.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

mod error;
mod local;
pub mod pipeline;
mod remote;
pub mod shell;
mod url;

pub use error::{EndpointError, PipelineError};
pub use local::LocalEndpoint;
pub use remote::RemoteEndpoint;
pub use url::{EndpointSpec, EndpointUrl, UrlError};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum number of stderr bytes retained for diagnostics.
pub const STDERR_TAIL_LIMIT: usize = 4096;

/// A command as an argument vector, rendered with shell quoting on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
}

impl CommandLine {
    /// Starts a command line with the program name.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Appends each argument of the iterator.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// The raw argument vector, program first.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The command as a single shell-safe word sequence.
    #[must_use]
    pub fn rendered(&self) -> String {
        shell::join_words(&self.argv)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered())
    }
}

/// Captured result of a synchronously executed command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code, `128 + signal` when the process was signalled.
    pub exit_code: i32,
    /// Complete captured stdout.
    pub stdout: Vec<u8>,
    /// Bounded stderr tail.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Stdout decoded leniently for line-oriented parsing.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Exit record of one pipeline stage.
#[derive(Clone, Debug)]
pub struct StageStatus {
    /// Rendered command of the stage (or composed remote pipeline).
    pub command: String,
    /// Exit code, `128 + signal` when signalled.
    pub exit_code: i32,
    /// Bounded stderr tail collected while the stage ran.
    pub stderr_tail: String,
}

impl StageStatus {
    /// Whether the stage exited cleanly.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Requested plumbing for the outer ends of a spawned stage group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Connect to the null device.
    Null,
    /// Expose as a pipe to the caller.
    Piped,
}

/// Outer stdin/stdout plumbing of a stage group.
#[derive(Clone, Copy, Debug)]
pub struct GroupIo {
    /// Where the first stage reads from.
    pub stdin: StreamMode,
    /// Where the last stage writes to.
    pub stdout: StreamMode,
}

/// A spawned group of pipeline stages on one endpoint.
pub trait StageGroup: Send {
    /// Takes the writable end feeding the first stage, if piped.
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Takes the readable end draining the last stage, if piped.
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Polls the group without blocking.
    ///
    /// Returns the exits in stage order once every stage has finished; a
    /// remote group reports a single composed status.
    fn try_wait(&mut self) -> Result<Option<Vec<StageStatus>>, EndpointError>;

    /// Forcibly stops the group's first stage. The stages behind it keep
    /// running so they can drain to end-of-file on their own.
    fn terminate_producer(&mut self);

    /// Forcibly stops every stage still running.
    fn kill_all(&mut self);

    /// Blocks until every stage has exited.
    fn wait(&mut self) -> Result<Vec<StageStatus>, EndpointError> {
        loop {
            if let Some(statuses) = self.try_wait()? {
                return Ok(statuses);
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }
}

/// An execution site for filesystem commands and byte streams.
pub trait Endpoint: fmt::Debug + Send + Sync {
    /// Short identity used in logs and error context.
    fn label(&self) -> String;

    /// `(host, port)` identity of a remote endpoint, `None` for local.
    fn host_identity(&self) -> Option<(String, u16)>;

    /// Runs a command to completion; a non-zero exit is an error.
    fn exec(&self, command: &CommandLine) -> Result<CommandOutput, EndpointError>;

    /// Runs a command feeding it `input` on stdin; non-zero exit is an error.
    fn exec_with_input(
        &self,
        command: &CommandLine,
        input: &[u8],
    ) -> Result<CommandOutput, EndpointError>;

    /// Runs a command and reports its exit code without judging it.
    fn probe(&self, command: &CommandLine) -> Result<i32, EndpointError>;

    /// Starts the given stages as one streamed pipeline on this endpoint.
    ///
    /// Consecutive stages are coupled stdout-to-stdin; on a remote endpoint
    /// they are composed into a single shell pipeline so the whole group
    /// crosses one SSH channel.
    fn spawn_stages(
        &self,
        stages: &[CommandLine],
        io: GroupIo,
    ) -> Result<Box<dyn StageGroup>, EndpointError>;

    /// Reads a whole file.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, EndpointError>;

    /// Creates or replaces a file with the given contents.
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), EndpointError>;

    /// Removes a file. Missing files are not an error.
    fn remove_file(&self, path: &Path) -> Result<(), EndpointError>;

    /// Whether a regular file exists at `path`.
    fn file_exists(&self, path: &Path) -> Result<bool, EndpointError>;

    /// Whether a directory (or subvolume) exists at `path`.
    fn dir_exists(&self, path: &Path) -> Result<bool, EndpointError>;
}

/// Whether two endpoints address the same host.
///
/// Local equals local; remotes compare by `(host, port)` with the user
/// ignored.
#[must_use]
pub fn same_host(left: &dyn Endpoint, right: &dyn Endpoint) -> bool {
    left.host_identity() == right.host_identity()
}

/// Connects an [`EndpointUrl`] to a concrete endpoint.
#[must_use]
pub fn connect(url: &EndpointUrl) -> Arc<dyn Endpoint> {
    match url.spec() {
        EndpointSpec::Local => Arc::new(LocalEndpoint::new()),
        EndpointSpec::Remote { user, host, port } => Arc::new(RemoteEndpoint::new(
            user.clone(),
            host.clone(),
            *port,
        )),
    }
}

/// Cooperative cancellation flag shared between the signal handler, the
/// pipeline runner and the orchestrator.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// A fresh, unraised flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Idempotent.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

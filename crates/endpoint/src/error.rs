//! Typed failures for endpoint commands and pipelines.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::STDERR_TAIL_LIMIT;

/// A command failed on an endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The command ran and exited non-zero.
    #[error("`{command}` on {endpoint} exited with code {exit_code}{}", render_tail(.stderr_tail))]
    CommandFailed {
        /// Endpoint label the command ran on.
        endpoint: String,
        /// Rendered command line.
        command: String,
        /// Exit code, `128 + signal` when signalled.
        exit_code: i32,
        /// Bounded stderr tail.
        stderr_tail: String,
    },
    /// The command could not be started at all.
    #[error("could not start `{command}` on {endpoint}: {source}")]
    Spawn {
        /// Endpoint label the command was destined for.
        endpoint: String,
        /// Rendered command line.
        command: String,
        /// Underlying launch failure.
        source: io::Error,
    },
    /// Waiting on a running command failed.
    #[error("while awaiting `{command}` on {endpoint}: {source}")]
    Wait {
        /// Endpoint label.
        endpoint: String,
        /// Rendered command line.
        command: String,
        /// Underlying failure.
        source: io::Error,
    },
    /// A direct file operation failed.
    #[error("could not {operation} `{}` on {endpoint}: {source}", .path.display())]
    File {
        /// Endpoint label.
        endpoint: String,
        /// Operation attempted, e.g. `read`.
        operation: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },
}

impl EndpointError {
    pub(crate) fn command_failed(
        endpoint: &dyn crate::Endpoint,
        command: &crate::CommandLine,
        exit_code: i32,
        stderr: &[u8],
    ) -> Self {
        EndpointError::CommandFailed {
            endpoint: endpoint.label(),
            command: command.rendered(),
            exit_code,
            stderr_tail: stderr_tail(stderr),
        }
    }

    pub(crate) fn spawn(
        endpoint: &dyn crate::Endpoint,
        command: String,
        source: io::Error,
    ) -> Self {
        EndpointError::Spawn {
            endpoint: endpoint.label(),
            command,
            source,
        }
    }
}

/// A composed pipeline failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage could not be spawned or awaited.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// Every stage ran, but one exited non-zero.
    #[error("pipeline stage `{stage}` exited with code {exit_code}{}", render_tail(.stderr_tail))]
    StageFailed {
        /// Rendered command of the first failing stage.
        stage: String,
        /// Its exit code.
        exit_code: i32,
        /// Bounded stderr tail of that stage.
        stderr_tail: String,
    },
    /// The operator interrupted the run.
    #[error("pipeline interrupted")]
    Interrupted,
}

/// Bounded lossy decode of a stderr capture.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_LIMIT);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn render_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_is_bounded() {
        let noise = vec![b'x'; STDERR_TAIL_LIMIT * 2];
        assert_eq!(stderr_tail(&noise).len(), STDERR_TAIL_LIMIT);
    }

    #[test]
    fn command_failure_renders_context() {
        let error = EndpointError::CommandFailed {
            endpoint: "ssh://nas".to_string(),
            command: "btrfs subvolume delete /x".to_string(),
            exit_code: 1,
            stderr_tail: "ERROR: not a subvolume".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("ssh://nas"));
        assert!(text.contains("code 1"));
        assert!(text.contains("not a subvolume"));
    }
}

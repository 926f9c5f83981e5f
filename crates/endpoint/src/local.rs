//! Command execution on the calling host.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::error::stderr_tail;
use crate::{
    CommandLine, CommandOutput, Endpoint, EndpointError, GroupIo, StageGroup, StageStatus,
    StreamMode,
};

/// The local host: commands run as direct child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalEndpoint;

impl LocalEndpoint {
    /// A local execution site.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn command(&self, line: &CommandLine) -> Command {
        let argv = line.argv();
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command
    }

    fn run_captured(
        &self,
        line: &CommandLine,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, EndpointError> {
        trace!(command = %line, "exec");
        let mut command = self.command(line);
        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|source| EndpointError::spawn(self, line.rendered(), source))?;

        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            // A consumer that exits early closes the pipe; its exit code is
            // the interesting diagnostic, not the broken write.
            let _ = stdin.write_all(bytes);
        }

        let output = child
            .wait_with_output()
            .map_err(|source| EndpointError::Wait {
                endpoint: self.label(),
                command: line.rendered(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl Endpoint for LocalEndpoint {
    fn label(&self) -> String {
        "local".to_string()
    }

    fn host_identity(&self) -> Option<(String, u16)> {
        None
    }

    fn exec(&self, command: &CommandLine) -> Result<CommandOutput, EndpointError> {
        let output = self.run_captured(command, None)?;
        if output.exit_code != 0 {
            return Err(EndpointError::command_failed(
                self,
                command,
                output.exit_code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    fn exec_with_input(
        &self,
        command: &CommandLine,
        input: &[u8],
    ) -> Result<CommandOutput, EndpointError> {
        let output = self.run_captured(command, Some(input))?;
        if output.exit_code != 0 {
            return Err(EndpointError::command_failed(
                self,
                command,
                output.exit_code,
                &output.stderr,
            ));
        }
        Ok(output)
    }

    fn probe(&self, command: &CommandLine) -> Result<i32, EndpointError> {
        Ok(self.run_captured(command, None)?.exit_code)
    }

    fn spawn_stages(
        &self,
        stages: &[CommandLine],
        io: GroupIo,
    ) -> Result<Box<dyn StageGroup>, EndpointError> {
        let mut spawned: Vec<LocalStage> = Vec::with_capacity(stages.len());
        let mut carried: Option<ChildStdout> = None;

        for (index, stage) in stages.iter().enumerate() {
            let last = index == stages.len() - 1;

            let mut command = self.command(stage);
            command.stdin(match carried.take() {
                Some(upstream) => Stdio::from(upstream),
                None => stdio_for(io.stdin),
            });
            command.stdout(if last {
                stdio_for(io.stdout)
            } else {
                Stdio::piped()
            });
            command.stderr(Stdio::piped());

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(source) => {
                    for stage in &mut spawned {
                        let _ = stage.child.kill();
                    }
                    return Err(EndpointError::spawn(self, stage.rendered(), source));
                }
            };

            let stderr = child.stderr.take();
            let drain = stderr.map(|mut pipe| {
                thread::spawn(move || {
                    let mut tail = Vec::new();
                    let mut buffer = [0u8; 8192];
                    while let Ok(read) = pipe.read(&mut buffer) {
                        if read == 0 {
                            break;
                        }
                        tail.extend_from_slice(&buffer[..read]);
                        if tail.len() > crate::STDERR_TAIL_LIMIT * 2 {
                            tail.drain(..tail.len() - crate::STDERR_TAIL_LIMIT);
                        }
                    }
                    tail
                })
            });

            if !last {
                carried = child.stdout.take();
            }
            spawned.push(LocalStage {
                command: stage.rendered(),
                child,
                status: None,
                drain,
            });
        }

        Ok(Box::new(LocalStageGroup {
            endpoint_label: self.label(),
            stages: spawned,
        }))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, EndpointError> {
        fs::read(path).map_err(|source| file_error(self, "read", path, source))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), EndpointError> {
        fs::write(path, contents).map_err(|source| file_error(self, "write", path, source))
    }

    fn remove_file(&self, path: &Path) -> Result<(), EndpointError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(file_error(self, "remove", path, source)),
        }
    }

    fn file_exists(&self, path: &Path) -> Result<bool, EndpointError> {
        Ok(path.is_file())
    }

    fn dir_exists(&self, path: &Path) -> Result<bool, EndpointError> {
        Ok(path.is_dir())
    }
}

struct LocalStage {
    command: String,
    child: Child,
    status: Option<ExitStatus>,
    drain: Option<JoinHandle<Vec<u8>>>,
}

struct LocalStageGroup {
    endpoint_label: String,
    stages: Vec<LocalStage>,
}

impl StageGroup for LocalStageGroup {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stages
            .first_mut()
            .and_then(|stage| stage.child.stdin.take())
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stages
            .last_mut()
            .and_then(|stage| stage.child.stdout.take())
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> Result<Option<Vec<StageStatus>>, EndpointError> {
        let mut all_exited = true;
        for stage in &mut self.stages {
            if stage.status.is_some() {
                continue;
            }
            match stage.child.try_wait() {
                Ok(Some(status)) => stage.status = Some(status),
                Ok(None) => all_exited = false,
                Err(source) => {
                    return Err(EndpointError::Wait {
                        endpoint: self.endpoint_label.clone(),
                        command: stage.command.clone(),
                        source,
                    });
                }
            }
        }
        if !all_exited {
            return Ok(None);
        }

        let statuses = self
            .stages
            .iter_mut()
            .map(|stage| {
                let tail = stage
                    .drain
                    .take()
                    .and_then(|handle| handle.join().ok())
                    .unwrap_or_default();
                StageStatus {
                    command: stage.command.clone(),
                    exit_code: stage.status.map_or(-1, exit_code),
                    stderr_tail: stderr_tail(&tail),
                }
            })
            .collect();
        Ok(Some(statuses))
    }

    fn terminate_producer(&mut self) {
        if let Some(stage) = self.stages.first_mut() {
            if stage.status.is_none() {
                let _ = stage.child.kill();
            }
        }
    }

    fn kill_all(&mut self) {
        for stage in &mut self.stages {
            if stage.status.is_none() {
                let _ = stage.child.kill();
            }
        }
    }
}

fn stdio_for(mode: StreamMode) -> Stdio {
    match mode {
        StreamMode::Null => Stdio::null(),
        StreamMode::Piped => Stdio::piped(),
    }
}

fn file_error(
    endpoint: &LocalEndpoint,
    operation: &'static str,
    path: &Path,
    source: io::Error,
) -> EndpointError {
    EndpointError::File {
        endpoint: endpoint.label(),
        operation,
        path: path.to_path_buf(),
        source,
    }
}

/// Exit code of a finished process; signalled processes map to `128 + signal`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn exec_captures_stdout() {
        let endpoint = LocalEndpoint::new();
        let output = endpoint.exec(&sh("printf hello")).expect("command runs");
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.exit_code, 0);
    }

    #[test]
    fn exec_surfaces_exit_code_and_stderr() {
        let endpoint = LocalEndpoint::new();
        let error = endpoint
            .exec(&sh("echo boom >&2; exit 7"))
            .expect_err("command fails");
        match error {
            EndpointError::CommandFailed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, 7);
                assert_eq!(stderr_tail, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exec_with_input_feeds_stdin() {
        let endpoint = LocalEndpoint::new();
        let output = endpoint
            .exec_with_input(&sh("cat"), b"roundtrip")
            .expect("command runs");
        assert_eq!(output.stdout, b"roundtrip");
    }

    #[test]
    fn probe_reports_without_failing() {
        let endpoint = LocalEndpoint::new();
        assert_eq!(endpoint.probe(&sh("exit 3")).expect("probe runs"), 3);
        assert_eq!(endpoint.probe(&sh("true")).expect("probe runs"), 0);
    }

    #[test]
    fn file_roundtrip_and_idempotent_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = LocalEndpoint::new();
        let path = dir.path().join("descriptor");

        endpoint.write_file(&path, b"contents").expect("write");
        assert!(endpoint.file_exists(&path).expect("exists"));
        assert_eq!(endpoint.read_file(&path).expect("read"), b"contents");

        endpoint.remove_file(&path).expect("remove");
        endpoint.remove_file(&path).expect("second remove is a no-op");
        assert!(!endpoint.file_exists(&path).expect("exists"));
    }

    #[test]
    fn stage_group_wires_stages_and_reports_exits() {
        let endpoint = LocalEndpoint::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = dir.path().join("sink");

        let stages = [
            sh("printf streamed"),
            sh(&format!("cat > {}", sink.display())),
        ];
        let mut group = endpoint
            .spawn_stages(
                &stages,
                GroupIo {
                    stdin: StreamMode::Null,
                    stdout: StreamMode::Null,
                },
            )
            .expect("spawns");
        let statuses = group.wait().expect("waits");

        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(StageStatus::success));
        assert_eq!(fs::read(&sink).expect("sink written"), b"streamed");
    }

    #[test]
    fn stage_group_reports_first_failure() {
        let endpoint = LocalEndpoint::new();
        let stages = [sh("echo going down >&2; exit 3"), sh("cat > /dev/null")];
        let mut group = endpoint
            .spawn_stages(
                &stages,
                GroupIo {
                    stdin: StreamMode::Null,
                    stdout: StreamMode::Null,
                },
            )
            .expect("spawns");
        let statuses = group.wait().expect("waits");

        assert_eq!(statuses[0].exit_code, 3);
        assert_eq!(statuses[0].stderr_tail, "going down");
        assert_eq!(statuses[1].exit_code, 0);
    }
}

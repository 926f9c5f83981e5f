//! Command execution on a host reached through `ssh`.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::error::stderr_tail;
use crate::local::exit_code;
use crate::shell::quote_word;
use crate::{
    CommandLine, CommandOutput, Endpoint, EndpointError, GroupIo, StageGroup, StageStatus,
    StreamMode,
};

/// SSH options applied to every connection: refuse interactive prompts and
/// fail a hung link instead of stalling the whole run.
const SSH_OPTIONS: &[&str] = &[
    "-oBatchMode=yes",
    "-oServerAliveInterval=5",
    "-oServerAliveCountMax=3",
];

/// A host reached over SSH; commands are relayed to its login shell.
#[derive(Clone, Debug)]
pub struct RemoteEndpoint {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl RemoteEndpoint {
    /// An endpoint on `host`, optionally as `user` and on a custom port.
    #[must_use]
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self { user, host, port }
    }

    fn target(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host,
        }
    }

    /// The local `ssh` invocation relaying `script` to the remote shell.
    fn ssh_command(&self, script: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(SSH_OPTIONS);
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        command.arg(self.target());
        command.arg(script);
        command
    }

    fn run_captured(
        &self,
        line: &CommandLine,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, EndpointError> {
        let script = line.rendered();
        trace!(endpoint = %self.label(), command = %script, "exec");

        let mut command = self.ssh_command(&script);
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
            .map_err(|source| EndpointError::spawn(self, script.clone(), source))?;

        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            let _ = stdin.write_all(bytes);
        }

        let output = child
            .wait_with_output()
            .map_err(|source| EndpointError::Wait {
                endpoint: self.label(),
                command: script,
                source,
            })?;

        Ok(CommandOutput {
            exit_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn quoted_path(path: &Path) -> String {
        quote_word(&path.to_string_lossy()).into_owned()
    }
}

impl Endpoint for RemoteEndpoint {
    fn label(&self) -> String {
        let mut label = format!("ssh://{}", self.target());
        if let Some(port) = self.port {
            label.push_str(&format!(":{port}"));
        }
        label
    }

    fn host_identity(&self) -> Option<(String, u16)> {
        Some((self.host.clone(), self.port.unwrap_or(22)))
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
        // The whole group rides one SSH channel: the remote login shell runs
        // the composed pipeline.
        let script = stages
            .iter()
            .map(CommandLine::rendered)
            .collect::<Vec<_>>()
            .join(" | ");
        trace!(endpoint = %self.label(), pipeline = %script, "spawn");

        let mut command = self.ssh_command(&script);
        command
            .stdin(stdio_for(io.stdin))
            .stdout(stdio_for(io.stdout))
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|source| EndpointError::spawn(self, script.clone(), source))?;

        let drain = child.stderr.take().map(|mut pipe| {
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

        Ok(Box::new(RemoteStageGroup {
            endpoint_label: self.label(),
            command: script,
            child,
            status: None,
            drain,
        }))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, EndpointError> {
        Ok(self
            .exec(&CommandLine::new("cat").arg(path.to_string_lossy()))?
            .stdout)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), EndpointError> {
        let script = format!("cat > {}", Self::quoted_path(path));
        self.exec_with_input(&CommandLine::new("sh").arg("-c").arg(script), contents)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), EndpointError> {
        self.exec(&CommandLine::new("rm").arg("-f").arg(path.to_string_lossy()))?;
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> Result<bool, EndpointError> {
        Ok(self.probe(&CommandLine::new("test").arg("-f").arg(path.to_string_lossy()))? == 0)
    }

    fn dir_exists(&self, path: &Path) -> Result<bool, EndpointError> {
        Ok(self.probe(&CommandLine::new("test").arg("-d").arg(path.to_string_lossy()))? == 0)
    }
}

struct RemoteStageGroup {
    endpoint_label: String,
    command: String,
    child: Child,
    status: Option<ExitStatus>,
    drain: Option<JoinHandle<Vec<u8>>>,
}

impl StageGroup for RemoteStageGroup {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> Result<Option<Vec<StageStatus>>, EndpointError> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.status = Some(status),
                Ok(None) => return Ok(None),
                Err(source) => {
                    return Err(EndpointError::Wait {
                        endpoint: self.endpoint_label.clone(),
                        command: self.command.clone(),
                        source,
                    });
                }
            }
        }
        let tail = self
            .drain
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(Some(vec![StageStatus {
            command: self.command.clone(),
            exit_code: self.status.map_or(-1, exit_code),
            stderr_tail: stderr_tail(&tail),
        }]))
    }

    // Killing the local ssh client closes the channel; the remote login
    // shell then takes its pipeline down with it.
    fn terminate_producer(&mut self) {
        if self.status.is_none() {
            let _ = self.child.kill();
        }
    }

    fn kill_all(&mut self) {
        self.terminate_producer();
    }
}

fn stdio_for(mode: StreamMode) -> Stdio {
    match mode {
        StreamMode::Null => Stdio::null(),
        StreamMode::Piped => Stdio::piped(),
    }
}

//! Simulated endpoints for orchestration tests.
//!
//! [`FakeHost`] is an in-memory host: a directory tree standing in for the
//! filesystem, an interpreter for the command vocabulary the orchestrator
//! uses, and a stage-group implementation that emulates send/receive streams.
//! Two fake hosts behave like two machines; a single fake host shared by both
//! sides exercises the same-host pipeline collapse. [`FakeClock`] pins time
//! and turns retry pauses into clock advances.

#![doc(hidden)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;

use endpoint::{
    CommandLine, CommandOutput, Endpoint, EndpointError, EndpointUrl, GroupIo, StageGroup,
    StageStatus, StreamMode,
};

use crate::{Clock, Connector};

#[derive(Default)]
struct FakeFs {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl FakeFs {
    fn mkdir_all(&mut self, path: &Path) {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            self.dirs.insert(current.clone());
        }
    }

    fn remove_tree(&mut self, path: &Path) {
        self.dirs.retain(|dir| !dir.starts_with(path));
        self.files.retain(|file, _| !file.starts_with(path));
    }

    fn children(&self, path: &Path) -> Vec<String> {
        self.dirs
            .iter()
            .filter(|dir| dir.parent() == Some(path))
            .filter_map(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }
}

/// One simulated machine, sharable between endpoints and assertions.
#[derive(Clone)]
pub struct FakeHost {
    label: String,
    identity: Option<(String, u16)>,
    fs: Arc<Mutex<FakeFs>>,
    receive_failure: Arc<Mutex<Option<i32>>>,
    received: Arc<Mutex<Vec<String>>>,
    unreachable: Arc<AtomicBool>,
}

impl std::fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHost").field("label", &self.label).finish()
    }
}

impl FakeHost {
    /// A host that reads as the local machine.
    #[must_use]
    pub fn local() -> Self {
        Self {
            label: "fake-local".to_string(),
            identity: None,
            fs: Arc::default(),
            receive_failure: Arc::default(),
            received: Arc::default(),
            unreachable: Arc::default(),
        }
    }

    /// A host that reads as a remote machine named `host`.
    #[must_use]
    pub fn remote(host: &str) -> Self {
        Self {
            label: format!("fake://{host}"),
            identity: Some((host.to_string(), 22)),
            fs: Arc::default(),
            receive_failure: Arc::default(),
            received: Arc::default(),
            unreachable: Arc::default(),
        }
    }

    /// Header lines of every stream this host has successfully received.
    #[must_use]
    pub fn received_streams(&self) -> Vec<String> {
        self.received.lock().expect("fake fs lock").clone()
    }

    /// Creates a directory (and its ancestors) in the simulated tree.
    pub fn mkdir_all(&self, path: &Path) {
        self.fs.lock().expect("fake fs lock").mkdir_all(path);
    }

    /// Whether the simulated tree holds this directory.
    #[must_use]
    pub fn dir_exists(&self, path: &Path) -> bool {
        self.fs.lock().expect("fake fs lock").dirs.contains(path)
    }

    /// Contents of a simulated file, if present.
    #[must_use]
    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.fs.lock().expect("fake fs lock").files.get(path).cloned()
    }

    /// Writes a simulated file.
    pub fn put_file(&self, path: &Path, contents: &[u8]) {
        self.fs
            .lock()
            .expect("fake fs lock")
            .files
            .insert(path.to_path_buf(), contents.to_vec());
    }

    /// Child directory names directly below `path`, sorted.
    #[must_use]
    pub fn entries(&self, path: &Path) -> Vec<String> {
        self.fs.lock().expect("fake fs lock").children(path)
    }

    /// Makes the next received stream fail with `code` after consuming it.
    pub fn fail_next_receive(&self, code: i32) {
        *self.receive_failure.lock().expect("fake fs lock") = Some(code);
    }

    /// Makes every operation on this host fail like a dead SSH link.
    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    fn offline_error(&self, command: String) -> EndpointError {
        EndpointError::CommandFailed {
            endpoint: self.label.clone(),
            command,
            exit_code: 255,
            stderr_tail: "ssh: connect to host: Connection refused".to_string(),
        }
    }

    fn interpret(&self, argv: &[String]) -> (i32, Vec<u8>, Vec<u8>) {
        let words: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut fs = self.fs.lock().expect("fake fs lock");
        match words.as_slice() {
            ["btrfs", "subvolume", "list", "-o", path] => {
                let path = Path::new(path);
                if !fs.dirs.contains(path) {
                    return (1, Vec::new(), b"ERROR: can't access path".to_vec());
                }
                let base = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut out = String::new();
                for (index, child) in fs.children(path).iter().enumerate() {
                    out.push_str(&format!(
                        "ID {} gen {} top level 5 path {base}/{child}\n",
                        256 + index,
                        100 + index
                    ));
                }
                (0, out.into_bytes(), Vec::new())
            }
            ["btrfs", "subvolume", "snapshot", "-r", source, target] => {
                let source = Path::new(source);
                let target = Path::new(target);
                if !fs.dirs.contains(source) {
                    return (1, Vec::new(), b"ERROR: not a subvolume".to_vec());
                }
                if fs.dirs.contains(target) {
                    return (1, Vec::new(), b"ERROR: target exists".to_vec());
                }
                fs.mkdir_all(target);
                (0, Vec::new(), Vec::new())
            }
            ["btrfs", "subvolume", "create", path] => {
                let path = Path::new(path);
                if fs.dirs.contains(path) {
                    return (1, Vec::new(), b"ERROR: target exists".to_vec());
                }
                fs.mkdir_all(path);
                (0, Vec::new(), Vec::new())
            }
            ["btrfs", "subvolume", "delete", path] => {
                let path = Path::new(path).to_path_buf();
                if !fs.dirs.contains(&path) {
                    return (1, Vec::new(), b"ERROR: not a subvolume".to_vec());
                }
                fs.remove_tree(&path);
                (0, Vec::new(), Vec::new())
            }
            ["btrfs", "subvolume", "show", path] => {
                if fs.dirs.contains(Path::new(path)) {
                    (0, Vec::new(), Vec::new())
                } else {
                    (1, Vec::new(), b"ERROR: not a subvolume".to_vec())
                }
            }
            ["test", "-d", path] => (i32::from(!fs.dirs.contains(Path::new(path))), Vec::new(), Vec::new()),
            ["test", "-f", path] => (
                i32::from(!fs.files.contains_key(Path::new(path))),
                Vec::new(),
                Vec::new(),
            ),
            ["sh", "-c", script] if script.starts_with("command -v pv") => {
                // No progress meter on simulated hosts.
                (1, Vec::new(), Vec::new())
            }
            _ => (127, Vec::new(), b"command not found".to_vec()),
        }
    }

    fn run(&self, command: &CommandLine) -> Result<CommandOutput, EndpointError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.offline_error(command.rendered()));
        }
        let (exit_code, stdout, stderr) = self.interpret(command.argv());
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn check_online(&self, operation: &str) -> Result<(), EndpointError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.offline_error(operation.to_string()));
        }
        Ok(())
    }
}

impl Endpoint for FakeHost {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn host_identity(&self) -> Option<(String, u16)> {
        self.identity.clone()
    }

    fn exec(&self, command: &CommandLine) -> Result<CommandOutput, EndpointError> {
        let output = self.run(command)?;
        if output.exit_code != 0 {
            return Err(EndpointError::CommandFailed {
                endpoint: self.label.clone(),
                command: command.rendered(),
                exit_code: output.exit_code,
                stderr_tail: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    fn exec_with_input(
        &self,
        command: &CommandLine,
        input: &[u8],
    ) -> Result<CommandOutput, EndpointError> {
        self.check_online(&command.rendered())?;
        let words: Vec<&str> = command.argv().iter().map(String::as_str).collect();
        if let ["sh", "-c", script] = words.as_slice() {
            if let Some(path) = script.strip_prefix("cat > ") {
                let path = path.trim_matches('\'');
                self.put_file(Path::new(path), input);
                return Ok(CommandOutput {
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }
        }
        self.exec(command)
    }

    fn probe(&self, command: &CommandLine) -> Result<i32, EndpointError> {
        Ok(self.run(command)?.exit_code)
    }

    fn spawn_stages(
        &self,
        stages: &[CommandLine],
        io: GroupIo,
    ) -> Result<Box<dyn StageGroup>, EndpointError> {
        self.check_online("spawn")?;
        let parsed = stages
            .iter()
            .map(|stage| parse_stage(stage).ok_or_else(|| EndpointError::Spawn {
                endpoint: self.label.clone(),
                command: stage.rendered(),
                source: io::Error::new(io::ErrorKind::Unsupported, "unknown stage"),
            }))
            .collect::<Result<Vec<_>, _>>()?;

        let commands: Vec<String> = stages.iter().map(CommandLine::rendered).collect();
        Ok(Box::new(FakeStageGroup::new(self.clone(), parsed, commands, io)))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, EndpointError> {
        self.check_online("read")?;
        self.file(path).ok_or_else(|| EndpointError::File {
            endpoint: self.label.clone(),
            operation: "read",
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        })
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), EndpointError> {
        self.check_online("write")?;
        self.put_file(path, contents);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), EndpointError> {
        self.check_online("remove")?;
        self.fs.lock().expect("fake fs lock").files.remove(path);
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> Result<bool, EndpointError> {
        self.check_online("stat")?;
        Ok(self.fs.lock().expect("fake fs lock").files.contains_key(path))
    }

    fn dir_exists(&self, path: &Path) -> Result<bool, EndpointError> {
        self.check_online("stat")?;
        Ok(self.fs.lock().expect("fake fs lock").dirs.contains(path))
    }
}

#[derive(Clone, Debug)]
enum FakeStage {
    Send {
        parent: Option<String>,
        path: PathBuf,
    },
    Receive {
        dir: PathBuf,
    },
    Compress,
    Decompress,
    Progress,
}

fn parse_stage(stage: &CommandLine) -> Option<FakeStage> {
    let words: Vec<&str> = stage.argv().iter().map(String::as_str).collect();
    match words.as_slice() {
        ["btrfs", "send", "-p", parent, path] => Some(FakeStage::Send {
            parent: Path::new(parent)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            path: PathBuf::from(path),
        }),
        ["btrfs", "send", path] => Some(FakeStage::Send {
            parent: None,
            path: PathBuf::from(path),
        }),
        ["btrfs", "receive", dir] => Some(FakeStage::Receive {
            dir: PathBuf::from(dir),
        }),
        ["lzop", "-c"] => Some(FakeStage::Compress),
        ["lzop", "-d"] => Some(FakeStage::Decompress),
        ["pv"] => Some(FakeStage::Progress),
        _ => None,
    }
}

/// Wire format of the simulated send stream.
fn encode_stream(parent: Option<&str>, source: &Path, compressed: bool) -> Vec<u8> {
    format!(
        "sxstream compressed={} parent={} source={}\n",
        u8::from(compressed),
        parent.unwrap_or("-"),
        source.display()
    )
    .into_bytes()
}

struct FakeStageGroup {
    host: FakeHost,
    stages: Vec<FakeStage>,
    commands: Vec<String>,
    stdout: Option<Box<dyn Read + Send>>,
    incoming: Option<Receiver<Vec<u8>>>,
    stdin: Option<Box<dyn Write + Send>>,
    send_error: Option<String>,
}

impl FakeStageGroup {
    fn new(host: FakeHost, stages: Vec<FakeStage>, commands: Vec<String>, io: GroupIo) -> Self {
        let mut group = Self {
            host,
            stages,
            commands,
            stdout: None,
            incoming: None,
            stdin: None,
            send_error: None,
        };

        if matches!(io.stdout, StreamMode::Piped) {
            let bytes = group.produce();
            group.stdout = Some(Box::new(Cursor::new(bytes)));
        }
        if matches!(io.stdin, StreamMode::Piped) {
            let (sender, receiver) = channel();
            group.incoming = Some(receiver);
            group.stdin = Some(Box::new(ChannelWriter { sender }));
        }
        group
    }

    fn send_stage(&self) -> Option<&FakeStage> {
        self.stages
            .iter()
            .find(|stage| matches!(stage, FakeStage::Send { .. }))
    }

    fn compresses(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| matches!(stage, FakeStage::Compress))
    }

    fn decompresses(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| matches!(stage, FakeStage::Decompress))
    }

    /// Bytes the producing side of this group emits.
    fn produce(&mut self) -> Vec<u8> {
        let Some(FakeStage::Send { parent, path }) = self.send_stage().cloned() else {
            return Vec::new();
        };
        if !self.host.dir_exists(&path) {
            self.send_error = Some(format!("ERROR: cannot access {}", path.display()));
            return Vec::new();
        }
        encode_stream(parent.as_deref(), &path, self.compresses())
    }

    /// Applies a fully received stream to the simulated tree.
    fn consume(&self, dir: &Path, stream: &[u8]) -> Result<(), String> {
        let text = String::from_utf8_lossy(stream);
        let line = text.lines().next().unwrap_or_default();
        let mut compressed = false;
        let mut parent: Option<String> = None;
        let mut source: Option<PathBuf> = None;

        let mut words = line.split_whitespace();
        if words.next() != Some("sxstream") {
            return Err("ERROR: not a send stream".to_string());
        }
        for word in words {
            match word.split_once('=') {
                Some(("compressed", value)) => compressed = value == "1",
                Some(("parent", "-")) => parent = None,
                Some(("parent", value)) => parent = Some(value.to_string()),
                Some(("source", value)) => source = Some(PathBuf::from(value)),
                _ => return Err("ERROR: corrupt stream header".to_string()),
            }
        }

        if compressed != self.decompresses() {
            return Err("ERROR: compression mismatch".to_string());
        }
        let source = source.ok_or_else(|| "ERROR: corrupt stream header".to_string())?;
        let basename = source
            .file_name()
            .ok_or_else(|| "ERROR: stream names nothing".to_string())?;

        if let Some(parent) = &parent {
            if !self.host.dir_exists(&dir.join(parent)) {
                return Err(format!("ERROR: parent subvolume {parent} not found"));
            }
        }
        self.host.mkdir_all(&dir.join(basename));
        self.host
            .received
            .lock()
            .expect("fake fs lock")
            .push(line.to_string());
        Ok(())
    }

    fn status(&self, index: usize, exit_code: i32, stderr: &str) -> StageStatus {
        StageStatus {
            command: self.commands[index].clone(),
            exit_code,
            stderr_tail: stderr.to_string(),
        }
    }

    fn stage_index(&self, predicate: impl Fn(&FakeStage) -> bool) -> usize {
        self.stages.iter().position(|stage| predicate(stage)).unwrap_or(0)
    }
}

struct ChannelWriter {
    sender: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StageGroup for FakeStageGroup {
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout.take()
    }

    // Simulated stages finish the moment they are observed, so the poll
    // always reports completion and the kill hooks have nothing to stop.
    fn try_wait(&mut self) -> Result<Option<Vec<StageStatus>>, EndpointError> {
        self.finish().map(Some)
    }

    fn terminate_producer(&mut self) {}

    fn kill_all(&mut self) {}
}

impl FakeStageGroup {
    fn finish(&mut self) -> Result<Vec<StageStatus>, EndpointError> {
        let mut statuses: Vec<StageStatus> = (0..self.stages.len())
            .map(|index| self.status(index, 0, ""))
            .collect();

        if let Some(error) = &self.send_error {
            let index = self.stage_index(|stage| matches!(stage, FakeStage::Send { .. }));
            statuses[index] = self.status(index, 1, error);
            return Ok(statuses);
        }

        let receive = self
            .stages
            .iter()
            .find_map(|stage| match stage {
                FakeStage::Receive { dir } => Some(dir.clone()),
                _ => None,
            });
        let Some(dir) = receive else {
            return Ok(statuses);
        };
        let index = self.stage_index(|stage| matches!(stage, FakeStage::Receive { .. }));

        // Drain the coupled stream, or synthesise it for a same-host run.
        let stream = match self.incoming.take() {
            Some(receiver) => {
                let mut bytes = Vec::new();
                while let Ok(chunk) = receiver.recv() {
                    bytes.extend_from_slice(chunk.as_slice());
                }
                bytes
            }
            None => {
                let Some(FakeStage::Send { parent, path }) = self.send_stage().cloned() else {
                    statuses[index] = self.status(index, 1, "ERROR: empty stream");
                    return Ok(statuses);
                };
                if !self.host.dir_exists(&path) {
                    let send = self.stage_index(|stage| matches!(stage, FakeStage::Send { .. }));
                    statuses[send] = self.status(send, 1, "ERROR: cannot access source");
                    return Ok(statuses);
                }
                encode_stream(parent.as_deref(), &path, self.compresses() && self.decompresses())
            }
        };

        if let Some(code) = self.host.receive_failure.lock().expect("fake fs lock").take() {
            statuses[index] = self.status(index, code, "ERROR: write: Input/output error");
            return Ok(statuses);
        }

        if let Err(message) = self.consume(&dir, &stream) {
            statuses[index] = self.status(index, 1, &message);
        }
        Ok(statuses)
    }
}

/// Deterministic clock; `pause` advances it instead of sleeping.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl FakeClock {
    /// A clock pinned at `start`.
    #[must_use]
    pub fn at(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock to an absolute instant.
    pub fn set(&self, instant: OffsetDateTime) {
        *self.now.lock().expect("fake clock lock") = instant;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().expect("fake clock lock");
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().expect("fake clock lock")
    }

    fn pause(&self, duration: Duration) {
        self.advance(time::Duration::try_from(duration).unwrap_or(time::Duration::SECOND));
    }
}

/// Routes URLs to fake hosts: local paths to the local host, `ssh://` URLs
/// to the registered remote of the same name.
pub struct FakeConnector {
    local: FakeHost,
    remotes: HashMap<String, FakeHost>,
}

impl FakeConnector {
    /// A connector with only a local host.
    #[must_use]
    pub fn single(local: FakeHost) -> Self {
        Self {
            local,
            remotes: HashMap::new(),
        }
    }

    /// Registers a remote host under its SSH host name.
    #[must_use]
    pub fn with_remote(mut self, name: &str, host: FakeHost) -> Self {
        self.remotes.insert(name.to_string(), host);
        self
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &EndpointUrl) -> Arc<dyn Endpoint> {
        match url.spec() {
            endpoint::EndpointSpec::Local => Arc::new(self.local.clone()),
            endpoint::EndpointSpec::Remote { host, .. } => Arc::new(
                self.remotes
                    .get(host)
                    .unwrap_or_else(|| panic!("no fake host registered for `{host}`"))
                    .clone(),
            ),
        }
    }
}

//! Streamed composition of commands across one or two endpoints.
//!
//! A [`Pipeline`] is an ordered list of stages, each pinned to an endpoint.
//! Consecutive stages on the same host are spawned as one
//! [`StageGroup`](crate::StageGroup): wired stdout-to-stdin kernel-side
//! locally, or composed into a single remote shell pipeline so each remote
//! side uses exactly one SSH channel. Adjacent groups on different hosts are
//! coupled by a pump thread, whose bounded copies give the whole pipeline
//! end-to-end backpressure.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    CommandLine, Endpoint, GroupIo, Interrupt, PipelineError, StageStatus, StreamMode, same_host,
};

const PUMP_BUFFER: usize = 128 * 1024;

/// How often running stages are polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a cancelled pipeline may drain before survivors are killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// One stage of a pipeline: a command pinned to an endpoint.
pub struct Stage {
    endpoint: Arc<dyn Endpoint>,
    command: CommandLine,
}

/// An ordered set of stages streamed into one another.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage running `command` on `endpoint`.
    #[must_use]
    pub fn stage(mut self, endpoint: Arc<dyn Endpoint>, command: CommandLine) -> Self {
        self.stages.push(Stage { endpoint, command });
        self
    }

    /// Runs the pipeline to completion.
    ///
    /// Succeeds iff every stage exits zero. A non-zero exit lets the other
    /// stages drain so their own diagnostics surface, then reports the first
    /// failing stage in stage order. Raising `interrupt` terminates the
    /// producer at once so downstream stages can drain to end-of-file;
    /// whatever is still running after a short grace period is killed.
    pub fn run(self, interrupt: &Interrupt) -> Result<Vec<StageStatus>, PipelineError> {
        assert!(!self.stages.is_empty(), "pipeline needs at least one stage");

        let groups = self.grouped();
        let last = groups.len() - 1;

        let mut running = Vec::with_capacity(groups.len());
        for (index, (endpoint, commands)) in groups.into_iter().enumerate() {
            let io = GroupIo {
                stdin: if index == 0 {
                    StreamMode::Null
                } else {
                    StreamMode::Piped
                },
                stdout: if index == last {
                    StreamMode::Null
                } else {
                    StreamMode::Piped
                },
            };
            running.push(endpoint.spawn_stages(&commands, io)?);
        }

        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        for index in 0..running.len().saturating_sub(1) {
            let (upstream, downstream) = {
                let (left, right) = running.split_at_mut(index + 1);
                (left[index].take_stdout(), right[0].take_stdin())
            };
            if let (Some(reader), Some(writer)) = (upstream, downstream) {
                let flag = interrupt.clone();
                pumps.push(thread::spawn(move || pump(reader, writer, &flag)));
            }
        }

        let mut finished: Vec<Option<Vec<StageStatus>>> = Vec::new();
        finished.resize_with(running.len(), || None);
        let mut kill_at: Option<Instant> = None;

        loop {
            let mut all_exited = true;
            for (index, group) in running.iter_mut().enumerate() {
                if finished[index].is_none() {
                    match group.try_wait()? {
                        Some(statuses) => finished[index] = Some(statuses),
                        None => all_exited = false,
                    }
                }
            }
            if all_exited {
                break;
            }

            if interrupt.is_raised() {
                match kill_at {
                    None => {
                        // The producer dies first; the stages behind it see
                        // end-of-file and get a chance to exit on their own.
                        running[0].terminate_producer();
                        kill_at = Some(Instant::now() + KILL_GRACE);
                    }
                    Some(deadline) if Instant::now() >= deadline => {
                        for group in &mut running {
                            group.kill_all();
                        }
                    }
                    Some(_) => {}
                }
            }
            thread::sleep(POLL_INTERVAL);
        }

        for pump in pumps {
            let _ = pump.join();
        }

        let statuses: Vec<StageStatus> = finished.into_iter().flatten().flatten().collect();
        if interrupt.is_raised() {
            return Err(PipelineError::Interrupted);
        }
        if let Some(failed) = statuses.iter().find(|status| !status.success()) {
            debug!(stage = %failed.command, code = failed.exit_code, "pipeline stage failed");
            return Err(PipelineError::StageFailed {
                stage: failed.command.clone(),
                exit_code: failed.exit_code,
                stderr_tail: failed.stderr_tail.clone(),
            });
        }
        Ok(statuses)
    }

    /// Splits the stages into maximal same-host runs, preserving order.
    fn grouped(self) -> Vec<(Arc<dyn Endpoint>, Vec<CommandLine>)> {
        let mut groups: Vec<(Arc<dyn Endpoint>, Vec<CommandLine>)> = Vec::new();
        for stage in self.stages {
            match groups.last_mut() {
                Some((endpoint, commands))
                    if same_host(endpoint.as_ref(), stage.endpoint.as_ref()) =>
                {
                    commands.push(stage.command);
                }
                _ => groups.push((stage.endpoint, vec![stage.command])),
            }
        }
        groups
    }
}

/// Copies bytes until end-of-file, a dead peer, or cancellation.
///
/// Dropping both ends on the way out propagates end-of-file downstream and
/// breaks the upstream pipe, which is what stops the producer.
fn pump(mut reader: Box<dyn Read + Send>, mut writer: Box<dyn Write + Send>, interrupt: &Interrupt) {
    let mut buffer = vec![0u8; PUMP_BUFFER];
    loop {
        if interrupt.is_raised() {
            return;
        }
        match reader.read(&mut buffer) {
            Ok(0) | Err(_) => return,
            Ok(count) => {
                if writer.write_all(&buffer[..count]).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::LocalEndpoint;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(script)
    }

    fn local() -> Arc<dyn Endpoint> {
        Arc::new(LocalEndpoint::new())
    }

    #[test]
    fn same_host_stages_collapse_into_one_group() {
        let endpoint = local();
        let pipeline = Pipeline::new()
            .stage(endpoint.clone(), sh("a"))
            .stage(endpoint.clone(), sh("b"))
            .stage(endpoint, sh("c"));
        let groups = pipeline.grouped();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 3);
    }

    #[test]
    fn streams_bytes_through_every_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = dir.path().join("sink");
        let endpoint = local();

        let statuses = Pipeline::new()
            .stage(endpoint.clone(), sh("printf 'one two three'"))
            .stage(endpoint.clone(), sh("tr a-z A-Z"))
            .stage(endpoint, sh(&format!("cat > {}", sink.display())))
            .run(&Interrupt::new())
            .expect("pipeline succeeds");

        assert_eq!(statuses.len(), 3);
        assert_eq!(fs::read(&sink).expect("sink written"), b"ONE TWO THREE");
    }

    #[test]
    fn failing_stage_poisons_the_pipeline() {
        let endpoint = local();
        let error = Pipeline::new()
            .stage(endpoint.clone(), sh("echo crashed >&2; exit 3"))
            .stage(endpoint, sh("cat > /dev/null"))
            .run(&Interrupt::new())
            .expect_err("pipeline fails");

        match error {
            PipelineError::StageFailed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr_tail, "crashed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn first_failure_wins_in_stage_order() {
        let endpoint = local();
        let error = Pipeline::new()
            .stage(endpoint.clone(), sh("exit 4"))
            .stage(endpoint, sh("cat > /dev/null; exit 5"))
            .run(&Interrupt::new())
            .expect_err("pipeline fails");

        match error {
            PipelineError::StageFailed { exit_code, .. } => assert_eq!(exit_code, 4),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn raised_interrupt_reports_interrupted() {
        let endpoint = local();
        let interrupt = Interrupt::new();
        interrupt.raise();

        let error = Pipeline::new()
            .stage(endpoint, sh("true"))
            .run(&interrupt)
            .expect_err("interrupted pipelines do not succeed");
        assert!(matches!(error, PipelineError::Interrupted));
    }

    fn raise_after(interrupt: &Interrupt, delay: Duration) -> JoinHandle<()> {
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            interrupt.raise();
        })
    }

    #[test]
    fn interrupt_terminates_the_producer_and_lets_consumers_drain() {
        let endpoint = local();
        let interrupt = Interrupt::new();
        let raiser = raise_after(&interrupt, Duration::from_millis(200));

        // The producer would run for minutes; the consumer exits as soon as
        // its stdin reaches end-of-file.
        let started = Instant::now();
        let error = Pipeline::new()
            .stage(endpoint.clone(), sh("sleep 120"))
            .stage(endpoint, sh("cat > /dev/null"))
            .run(&interrupt)
            .expect_err("interrupted pipelines do not succeed");
        raiser.join().expect("raiser thread");

        assert!(matches!(error, PipelineError::Interrupted));
        // run() only returns once try_wait has reaped every stage, so a
        // bounded elapsed time means both children are gone.
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "pipeline survived cancellation for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn interrupt_kills_survivors_after_the_grace_period() {
        let endpoint = local();
        let interrupt = Interrupt::new();
        let raiser = raise_after(&interrupt, Duration::from_millis(200));

        // The consumer never reads its stdin, so end-of-file cannot stop it;
        // only the timed kill can.
        let started = Instant::now();
        let error = Pipeline::new()
            .stage(endpoint.clone(), sh("sleep 120"))
            .stage(endpoint, sh("sleep 120"))
            .run(&interrupt)
            .expect_err("interrupted pipelines do not succeed");
        raiser.join().expect("raiser thread");

        assert!(matches!(error, PipelineError::Interrupted));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "survivor outlived the grace period: {:?}",
            started.elapsed()
        );
    }
}

#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `cli` is the thin command-line frontend over the [`job`] orchestrator. It
//! recognises the subcommands `init`, `run`, `update`, `info`, `purge`,
//! `destroy` and `transfer`, initialises diagnostics from `-q`/`-v`, installs
//! the interrupt handler, and maps outcomes onto the exit codes `0`
//! (success), `1` (runtime error), `2` (usage error) and `130` (interrupted).
//!
//! The crate exposes [`run`] so the binary and tests share one entry point;
//! commands taking several locations process each in turn and fold failures
//! into the final exit code.

use std::env;
use std::error::Error as _;
use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::ArgMatches;
use time::UtcOffset;

use endpoint::{EndpointSpec, EndpointUrl, Interrupt};
use job::{
    transfer_subvolume, InitOptions, Job, JobError, PurgeOptions, SystemClock, SystemConnector,
    UpdateOptions,
};
use retention::RetentionExpression;

mod command;
mod logging;
mod signal;

/// Successful completion.
pub const EXIT_OK: i32 = 0;
/// A command failed at runtime.
pub const EXIT_RUNTIME: i32 = 1;
/// The invocation itself was wrong.
pub const EXIT_USAGE: i32 = 2;
/// The operator interrupted the command.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Parses arguments, executes the requested command, returns the exit code.
pub fn run<I, S>(arguments: I, stdout: &mut dyn Write, stderr: &mut dyn Write) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let matches = match command::command().try_get_matches_from(arguments) {
        Ok(matches) => matches,
        Err(error) => {
            let uses_stdout = matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            if uses_stdout {
                let _ = write!(stdout, "{}", error.render());
                return EXIT_OK;
            }
            let _ = write!(stderr, "{}", error.render());
            return EXIT_USAGE;
        }
    };

    let quiet = matches.get_flag("quiet");
    let verbosity = matches.get_count("verbose");
    logging::init(quiet, verbosity);

    let interrupt = Interrupt::new();
    signal::install(&interrupt);

    dispatch(&matches, stdout, stderr, &interrupt, verbosity)
}

/// Clamps an exit code into the range the OS can carry.
#[must_use]
pub fn exit_code_from(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

fn dispatch(
    matches: &ArgMatches,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    interrupt: &Interrupt,
    verbosity: u8,
) -> i32 {
    let connector = SystemConnector;
    let clock = SystemClock;

    match matches.subcommand() {
        Some(("init", sub)) => {
            let (source, destination) = match two_urls(sub) {
                Ok(urls) => urls,
                Err(message) => return usage_error(stderr, &message),
            };
            let (source_retention, destination_retention) = match retention_overrides(sub) {
                Ok(expressions) => expressions,
                Err(message) => return usage_error(stderr, &message),
            };
            let options = InitOptions {
                source,
                destination,
                source_retention,
                destination_retention,
                compress: sub.get_flag("compress"),
            };
            match Job::init(&connector, options) {
                Ok(_) => EXIT_OK,
                Err(error) => report(&error, stderr, verbosity),
            }
        }
        Some(("run", sub)) => for_each_location(sub, stderr, interrupt, verbosity, |url| {
            let mut job = Job::load(&connector, url)?;
            job.run(&clock, interrupt).map(|_| ())
        }),
        Some(("update", sub)) => {
            let (source_retention, destination_retention) = match retention_overrides(sub) {
                Ok(expressions) => expressions,
                Err(message) => return usage_error(stderr, &message),
            };
            let compress = if sub.get_flag("compress") {
                Some(true)
            } else if sub.get_flag("no-compress") {
                Some(false)
            } else {
                None
            };
            for_each_location(sub, stderr, interrupt, verbosity, |url| {
                let mut job = Job::load(&connector, url)?;
                job.update(UpdateOptions {
                    source_retention: source_retention.clone(),
                    destination_retention: destination_retention.clone(),
                    compress,
                })
            })
        }
        Some(("info", sub)) => {
            let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
            for_each_location(sub, stderr, interrupt, verbosity, |url| {
                let job = Job::load(&connector, url)?;
                job.info(&mut *stdout, offset)
            })
        }
        Some(("purge", sub)) => {
            let (source_retention, destination_retention) = match retention_overrides(sub) {
                Ok(expressions) => expressions,
                Err(message) => return usage_error(stderr, &message),
            };
            for_each_location(sub, stderr, interrupt, verbosity, |url| {
                let job = Job::load(&connector, url)?;
                job.purge(
                    &clock,
                    PurgeOptions {
                        source_retention: source_retention.clone(),
                        destination_retention: destination_retention.clone(),
                    },
                )
            })
        }
        Some(("destroy", sub)) => {
            let purge = sub.get_flag("purge");
            for_each_location(sub, stderr, interrupt, verbosity, |url| {
                let job = Job::load(&connector, url)?;
                job.destroy(purge)
            })
        }
        Some(("transfer", sub)) => {
            let (source, destination) = match two_urls(sub) {
                Ok(urls) => urls,
                Err(message) => return usage_error(stderr, &message),
            };
            match transfer_subvolume(
                &connector,
                &source,
                &destination,
                sub.get_flag("compress"),
                interrupt,
            ) {
                Ok(()) => EXIT_OK,
                Err(error) => report(&error, stderr, verbosity),
            }
        }
        _ => EXIT_USAGE,
    }
}

fn for_each_location<F>(
    sub: &ArgMatches,
    stderr: &mut dyn Write,
    interrupt: &Interrupt,
    verbosity: u8,
    mut command: F,
) -> i32
where
    F: FnMut(&EndpointUrl) -> Result<(), JobError>,
{
    let mut exit = EXIT_OK;
    for text in sub.get_many::<String>("locations").into_iter().flatten() {
        let url = match resolve_url(text) {
            Ok(url) => url,
            Err(message) => return usage_error(stderr, &message),
        };
        match command(&url) {
            Ok(()) => {}
            Err(error) if error.is_interrupted() => return EXIT_INTERRUPTED,
            Err(error) => {
                exit = report(&error, stderr, verbosity);
            }
        }
        if interrupt.is_raised() {
            return EXIT_INTERRUPTED;
        }
    }
    exit
}

fn two_urls(sub: &ArgMatches) -> Result<(EndpointUrl, EndpointUrl), String> {
    let source = sub
        .get_one::<String>("source")
        .map(String::as_str)
        .unwrap_or_default();
    let destination = sub
        .get_one::<String>("destination")
        .map(String::as_str)
        .unwrap_or_default();
    Ok((resolve_url(source)?, resolve_url(destination)?))
}

fn retention_overrides(
    sub: &ArgMatches,
) -> Result<(Option<RetentionExpression>, Option<RetentionExpression>), String> {
    Ok((
        parse_retention(sub, "source-retention")?,
        parse_retention(sub, "destination-retention")?,
    ))
}

fn parse_retention(sub: &ArgMatches, id: &str) -> Result<Option<RetentionExpression>, String> {
    sub.get_one::<String>(id)
        .map(|text| text.parse().map_err(|error| format!("--{id}: {error}")))
        .transpose()
}

/// Parses a location, anchoring relative local paths at the working
/// directory so descriptors always record absolute paths.
fn resolve_url(text: &str) -> Result<EndpointUrl, String> {
    let url = EndpointUrl::parse(text).map_err(|error| error.to_string())?;
    if matches!(url.spec(), EndpointSpec::Local) && url.path().is_relative() {
        let anchored = env::current_dir()
            .map_err(|error| format!("cannot resolve `{text}`: {error}"))?
            .join(url.path());
        return Ok(url.with_path(anchored));
    }
    Ok(url)
}

fn usage_error(stderr: &mut dyn Write, message: &str) -> i32 {
    let _ = writeln!(stderr, "error: {message}");
    EXIT_USAGE
}

/// One-line rendering, with the cause chain at raised verbosity.
fn report(error: &JobError, stderr: &mut dyn Write, verbosity: u8) -> i32 {
    let _ = writeln!(stderr, "error: {error}");
    if verbosity > 0 {
        let mut cause = error.source();
        while let Some(inner) = cause {
            let _ = writeln!(stderr, "  caused by: {inner}");
            cause = inner.source();
        }
    }
    if error.is_interrupted() {
        EXIT_INTERRUPTED
    } else {
        EXIT_RUNTIME
    }
}

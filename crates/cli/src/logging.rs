//! Diagnostic output configuration.
//!
//! Library crates emit through `tracing`; this module decides what reaches
//! the operator's terminal. `RUST_LOG` wins when set, otherwise `-q` and
//! repeated `-v` pick the level.

use tracing_subscriber::EnvFilter;

pub(crate) fn init(quiet: bool, verbosity: u8) {
    let default = if quiet {
        "error"
    } else {
        match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second call (tests, repeated embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

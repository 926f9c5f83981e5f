//! The clap command tree.

use clap::{Arg, ArgAction, Command};

const RETENTION_HELP: &str = "retention expression: a snapshot count such as `3`, or age-tier \
rules such as `1d:4/d, 1w:daily, 2m:none` (after one day keep four per day, after one week one \
per day, after two months none)";

pub(crate) fn command() -> Command {
    Command::new("btrfs-sxbackup")
        .about("Incremental btrfs snapshot backups between two subvolumes")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("only log errors"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("increase verbosity; may be given twice"),
        )
        .subcommand(
            Command::new("init")
                .about("initialize a backup job")
                .arg(
                    Arg::new("source")
                        .required(true)
                        .value_name("SOURCE")
                        .help("source subvolume, local path or ssh:// url"),
                )
                .arg(
                    Arg::new("destination")
                        .required(true)
                        .value_name("DESTINATION")
                        .help("destination container, local path or ssh:// url"),
                )
                .arg(retention_arg("source-retention"))
                .arg(retention_arg("destination-retention"))
                .arg(compress_arg()),
        )
        .subcommand(
            Command::new("run")
                .about("run one or more backup jobs")
                .arg(locations_arg()),
        )
        .subcommand(
            Command::new("update")
                .about("change retention or compression of existing jobs")
                .arg(locations_arg())
                .arg(retention_arg("source-retention"))
                .arg(retention_arg("destination-retention"))
                .arg(compress_arg())
                .arg(
                    Arg::new("no-compress")
                        .long("no-compress")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("compress")
                        .help("disable compression during transfers"),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("show job configuration and snapshots")
                .arg(locations_arg()),
        )
        .subcommand(
            Command::new("purge")
                .about("apply retention without taking a snapshot")
                .arg(locations_arg())
                .arg(retention_arg("source-retention"))
                .arg(retention_arg("destination-retention")),
        )
        .subcommand(
            Command::new("destroy")
                .about("remove job configuration, keeping snapshots by default")
                .arg(locations_arg())
                .arg(
                    Arg::new("purge")
                        .long("purge")
                        .action(ArgAction::SetTrue)
                        .help("also delete every managed snapshot on both sides"),
                ),
        )
        .subcommand(
            Command::new("transfer")
                .about("send a single read-only subvolume to a destination")
                .arg(
                    Arg::new("source")
                        .required(true)
                        .value_name("SOURCE")
                        .help("subvolume to send"),
                )
                .arg(
                    Arg::new("destination")
                        .required(true)
                        .value_name("DESTINATION")
                        .help("directory receiving it"),
                )
                .arg(compress_arg()),
        )
}

fn locations_arg() -> Arg {
    Arg::new("locations")
        .required(true)
        .num_args(1..)
        .value_name("SUBVOLUME")
        .help("backup job source or destination, local path or ssh:// url")
}

fn retention_arg(name: &'static str) -> Arg {
    Arg::new(name).long(name).value_name("EXPR").help(RETENTION_HELP)
}

fn compress_arg() -> Arg {
    Arg::new("compress")
        .short('c')
        .long("compress")
        .action(ArgAction::SetTrue)
        .help("compress the transfer stream; needs lzop on both sides")
}

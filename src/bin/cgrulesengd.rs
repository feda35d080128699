//! cgrulesengd — the control group rules engine daemon.
//!
//! Listens for kernel process events and moves processes into the
//! control groups the rules configuration maps their identity to.
//! SIGUSR2 reloads the rules, SIGUSR1 reloads the templates, and
//! SIGINT/SIGTERM shut the daemon down cleanly.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn, LevelFilter};
use nix::unistd::{chdir, fork, setsid, ForkResult, Group, User};

use cgroupctl::daemon::RulesDaemon;
use cgroupctl::Context;

#[derive(Parser)]
#[clap(name = "cgrulesengd", version, about = "control group rules engine daemon")]
struct Opts {
    /// Quiet mode: errors only
    #[clap(short, long)]
    quiet: bool,

    /// Verbose mode (repeat for more detail)
    #[clap(short, long, parse(from_occurrences))]
    verbose: u64,

    /// Stay in the foreground, do not fork
    #[clap(short = 'n', long)]
    nodaemon: bool,

    /// Rules configuration file
    #[clap(long, value_name = "FILE", default_value = "/etc/cgrules.conf")]
    config: PathBuf,

    /// Rules drop-in directory
    #[clap(long, value_name = "DIR", default_value = "/etc/cgrules.d")]
    config_dir: PathBuf,

    /// Control socket path
    #[clap(long, value_name = "PATH", default_value = "/var/run/cgred.socket")]
    socket_path: PathBuf,

    /// Control socket owner user
    #[clap(short = 'u', long, value_name = "USER")]
    socket_user: Option<String>,

    /// Control socket owner group
    #[clap(short = 'g', long, value_name = "GROUP")]
    socket_group: Option<String>,
}

fn log_level(opts: &Opts) -> LevelFilter {
    if opts.quiet {
        return LevelFilter::Error;
    }
    match opts.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn run(opts: Opts) -> cgroupctl::Result<()> {
    let ctx = Arc::new(Context::new()?);
    ctx.set_rules_source(&opts.config, &opts.config_dir);
    ctx.load_rules()?;
    info!("loaded {} rules", ctx.rules_snapshot().len());

    let socket_uid = match opts.socket_user {
        Some(ref name) => match User::from_name(name) {
            Ok(Some(user)) => Some(user.uid.as_raw()),
            _ => {
                warn!("unknown socket user {}, keeping default owner", name);
                None
            }
        },
        None => None,
    };
    let socket_gid = match opts.socket_group {
        Some(ref name) => match Group::from_name(name) {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            _ => {
                warn!("unknown socket group {}, keeping default owner", name);
                None
            }
        },
        None => None,
    };

    if !opts.nodaemon {
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => exit(0),
            ForkResult::Child => {}
        }
        setsid()?;
        chdir("/")?;
    }

    // Sweep the processes that were already running before we started.
    if let Err(err) = ctx.change_all_cgroups() {
        warn!("initial classification sweep failed: {}", err);
    }

    let mut daemon = RulesDaemon::new(ctx);
    daemon.set_socket_path(opts.socket_path);
    daemon.set_socket_owner(socket_uid, socket_gid);
    daemon.run()
}

fn main() {
    let opts = Opts::parse();
    env_logger::Builder::from_default_env()
        .filter_level(log_level(&opts))
        .init();

    if let Err(err) = run(opts) {
        eprintln!("cgrulesengd: {}", err);
        exit(1);
    }
}

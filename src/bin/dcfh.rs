use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::{Parser, Subcommand};
use lazy_static::lazy_static;

use dcfh::recovery::{DenyPrompt, FixMode, FixPrompt, StdinPrompt};
use dcfh::{format, OperationOptions, Repository, ShutdownSignal};

lazy_static! {
    static ref SHUTDOWN: ShutdownSignal = ShutdownSignal::new();
}

extern "C" fn handle_term_signal(_signal: libc::c_int) {
    SHUTDOWN.fire();
}

fn install_signal_handlers() -> Result<(), Error> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_term_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "dcfh", about = "directory content-integrity index", version)]
struct Cli {
    /// Repository root
    #[arg(short = 'C', long = "repository", default_value = ".")]
    repository: PathBuf,

    /// Increase verbosity (up to -vvv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format: human|json|fdupes
    #[arg(long)]
    format: Option<String>,

    /// Digest algorithm: sha1|sha256|sha512
    #[arg(long = "hash")]
    hash: Option<String>,

    /// Directory symlink policy: all|contained|none
    #[arg(long)]
    symlinks: Option<String>,

    /// Number of hash worker threads (1-64)
    #[arg(long = "hash-workers")]
    hash_workers: Option<u32>,

    /// Comma separated debug flags, each optionally flag:value
    #[arg(long)]
    debug: Option<String>,

    /// Fail instead of waiting when another scan is running
    #[arg(long = "no-wait")]
    no_wait: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show changes since the last commit
    Status,
    /// Commit the current state, wholly or for the given paths
    Update { paths: Vec<PathBuf> },
    /// List files with identical content
    Dedup,
    /// Repair the repository indices (fix mode: none|auto|manual)
    Recover {
        #[arg(long, default_value = "auto")]
        fix: String,
    },
    /// Report leftover scan/temp files of dead processes
    Orphans,
}

impl Cli {
    fn operation_options(&self) -> OperationOptions {
        let mut options: HashMap<String, String> = HashMap::new();
        if self.verbose > 0 {
            options.insert("v".into(), self.verbose.min(3).to_string());
        }
        if let Some(format) = &self.format {
            options.insert("format".into(), format.clone());
        }
        if let Some(hash) = &self.hash {
            options.insert("filehash".into(), hash.clone());
        }
        if let Some(symlinks) = &self.symlinks {
            options.insert("symlinks".into(), symlinks.clone());
        }
        if let Some(workers) = self.hash_workers {
            options.insert("hash_workers".into(), workers.to_string());
        }
        if let Some(debug) = &self.debug {
            options.insert("debug".into(), debug.clone());
        }

        OperationOptions {
            options,
            shutdown: SHUTDOWN.clone(),
            wait: !self.no_wait,
        }
    }

    fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_filter()),
    )
    .init();

    install_signal_handlers()?;

    let repo = Repository::open(&cli.repository)?;
    let opts = cli.operation_options();
    let config = repo.config().with_overrides(&opts.options)?;

    match &cli.command {
        Command::Status => {
            let report = repo.status(&opts)?;
            print!("{}", format::render_status(&report, config.format)?);
        }
        Command::Update { paths } => {
            repo.update(paths, &opts)?;
        }
        Command::Dedup => {
            let groups = repo.find_duplicates(&opts)?;
            print!("{}", format::render_duplicates(&groups, config.format)?);
        }
        Command::Recover { fix } => {
            let fix = match fix.as_str() {
                "none" => FixMode::None,
                "auto" => FixMode::Auto,
                "manual" => FixMode::Manual,
                other => bail!("bad fix mode {:?} (expected none|auto|manual)", other),
            };
            let mut stdin_prompt = StdinPrompt;
            let mut deny_prompt = DenyPrompt;
            let prompt: &mut dyn FixPrompt = if fix == FixMode::Manual {
                &mut stdin_prompt
            } else {
                &mut deny_prompt
            };
            repo.recover(&opts, fix, prompt)?;
        }
        Command::Orphans => {
            repo.report_orphans();
        }
    }

    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

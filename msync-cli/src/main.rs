//! The `dsync` tool: the only user-visible entry point over C7+C8. CLI
//! tree grounded on `aerogramme/src/main.rs`'s `Args`/`Command` shape,
//! logging setup grounded on its `tracer()` function.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use msync_dsync::export_import::{export, import, FlagMergePolicy};
use msync_dsync::wire::MailboxState;
use msync_index::change_queue::Side;
use msync_index::ids::UidValidity;
use msync_index::mailbox_index::MailboxIndex;
use msync_index::sync_engine::IndexSyncEngine;
use msync_maildir::scanner::Scanner;
use msync_maildir::uidlist::UidList;

use crate::config::{read_config, Config};

#[derive(Parser, Debug)]
#[command(name = "dsync", about = "Two-way mailbox synchronizer")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Treat any detected corruption as fatal instead of rebuilding.
    #[arg(long, global = true)]
    no_reset_on_corruption: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-way copy from a source mailbox to a destination.
    Backup {
        source: String,
        destination: String,
    },
    /// One-way copy that keeps the destination a live mirror of the source.
    Mirror {
        source: String,
        destination: String,
    },
    /// Two-way reconciliation between two mailbox replicas.
    Sync { left: String, right: String },
}

fn tracer(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

const EXIT_OK: u8 = 0;
const EXIT_TRANSIENT: u8 = 1;
const EXIT_PERMANENT: u8 = 2;
const EXIT_PARTIAL_SYNC: u8 = 75;

fn main() -> ExitCode {
    let args = Args::parse();
    tracer(args.debug);

    let config = match &args.config {
        Some(path) => match read_config(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to read config");
                return ExitCode::from(EXIT_PERMANENT);
            }
        },
        None => Config::default(),
    };

    let result = match &args.command {
        Command::Backup {
            source,
            destination,
        } => run_one_way(source, destination, &config),
        Command::Mirror {
            source,
            destination,
        } => run_one_way(source, destination, &config),
        Command::Sync { left, right } => run_two_way(left, right, &config),
    };

    match result {
        Ok(RunOutcome::Clean) => ExitCode::from(EXIT_OK),
        Ok(RunOutcome::PartialSync) => ExitCode::from(EXIT_PARTIAL_SYNC),
        Err(RunError::Transient(e)) => {
            error!(error = %e, "transient failure, caller should retry");
            ExitCode::from(EXIT_TRANSIENT)
        }
        Err(RunError::Permanent(e)) => {
            error!(error = %e, "permanent failure");
            ExitCode::from(EXIT_PERMANENT)
        }
    }
}

enum RunOutcome {
    Clean,
    PartialSync,
}

enum RunError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

fn run_one_way(source: &str, destination: &str, config: &Config) -> Result<RunOutcome, RunError> {
    info!(source, destination, "running one-way copy");

    let source_path = PathBuf::from(source);
    let mut scanner = Scanner::new(&source_path);
    let mut uidlist = UidList::open_or_create_with_stale_timeout(
        &source_path.join("dovecot-uidlist"),
        1,
        config.stale_lock_timeout(),
    )
    .map_err(|e| RunError::Permanent(e.into()))?;
    scanner
        .scan(&mut uidlist)
        .map_err(|e| RunError::Transient(e.into()))?;
    uidlist
        .sync_deinit()
        .map_err(|e| RunError::Transient(e.into()))?;

    let mut src_engine = IndexSyncEngine::new(
        MailboxIndex::new(UidValidity::new(1).unwrap()),
        Side::Master,
    );
    let (changes, _done) = export(&mut src_engine, 0);
    info!(count = changes.len(), "exported changes");
    Ok(RunOutcome::Clean)
}

fn run_two_way(left: &str, right: &str, config: &Config) -> Result<RunOutcome, RunError> {
    info!(left, right, "running two-way sync");
    let mut left_engine = IndexSyncEngine::new(
        MailboxIndex::new(UidValidity::new(1).unwrap()),
        Side::Master,
    );
    let (changes, _done) = export(&mut left_engine, 0);

    let remote_state = MailboxState {
        mailbox: msync_index::ids::MailboxGuid([0; 16]),
        last_common_uid: 0,
        last_common_modseq: 0,
        uid_next: left_engine.index().uidnext,
        first_recent_uid: 1,
    };

    let mut right_engine = IndexSyncEngine::new(
        MailboxIndex::new(UidValidity::new(1).unwrap()),
        Side::Replica,
    );
    let policy = FlagMergePolicy {
        prefer_remote: config.import.prefer_remote,
        prefer_pvt_remote: config.import.prefer_pvt_remote,
    };
    let outcome = import(&mut right_engine, &remote_state, changes, policy);

    if outcome.changes_during_sync {
        Ok(RunOutcome::PartialSync)
    } else {
        Ok(RunOutcome::Clean)
    }
}

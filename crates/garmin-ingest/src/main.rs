use std::path::PathBuf;

use clap::{Parser, Subcommand};
use garmin_ingest::cli::commands::{self, Overrides};
use garmin_ingest::sync::RunReport;

#[derive(Parser)]
#[command(name = "garmin-ingest")]
#[command(author, version, about = "Incremental Garmin data ingestion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "GARMIN_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Token profile to use
    #[arg(short, long, global = true, env = "GARMIN_PROFILE")]
    profile: Option<String>,

    /// First day to sync (YYYY-MM-DD)
    #[arg(long, global = true)]
    start: Option<String>,

    /// Last day to sync (YYYY-MM-DD), defaults to today
    #[arg(long, global = true)]
    end: Option<String>,

    /// Skip failing windows and files instead of aborting
    #[arg(long, global = true)]
    lenient: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync from Garmin Connect
    Sync,
    /// Import an unpacked account export
    ImportExport {
        /// Export directory
        dir: PathBuf,
    },
    /// Import FIT files, zip archives or directories of them
    ImportFit {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Show committed watermarks
    Status,
    /// Move a watermark back so the next run re-fetches
    Reset {
        /// Metric kind (e.g. heart_rate)
        #[arg(short, long)]
        kind: String,
        /// New watermark (YYYY-MM-DD); omit to start over
        #[arg(short, long)]
        to: Option<String>,
    },
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init_custom_env("RUST_LOG");
}

#[tokio::main]
async fn main() -> garmin_ingest::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let overrides = Overrides {
        config: cli.config,
        profile: cli.profile,
        start: cli.start,
        end: cli.end,
        lenient: cli.lenient,
    };

    let result: garmin_ingest::Result<Option<RunReport>> = match cli.command {
        Commands::Sync => commands::sync_run(&overrides).await.map(Some),
        Commands::ImportExport { dir } => commands::import_export(dir, &overrides).await.map(Some),
        Commands::ImportFit { paths } => commands::import_fit(paths, &overrides).await.map(Some),
        Commands::Status => commands::status(&overrides).await.map(|_| None),
        Commands::Reset { kind, to } => commands::reset(&kind, to, &overrides).await.map(|_| None),
    };

    match result {
        Ok(Some(report)) => {
            println!("\n{}", report.summary());
            if report.is_aborted() {
                std::process::exit(1);
            }
        }
        Ok(None) => {}
        Err(e) => {
            eprintln!("Error: {}", garmin_ingest::error::format_user_error(&e));
            std::process::exit(1);
        }
    }

    Ok(())
}

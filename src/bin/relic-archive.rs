//! Archiver binary: moves aged rows to cold storage per the YAML
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use clap::Parser;

use relic_archiver::archive::run_archival;
use relic_archiver::audit::AuditTrail;
use relic_archiver::{logging, shutdown};
use relic_object_store::ObjectStore;

#[derive(Parser)]
#[command(name = "relic-archive", version, about = "Archive aged table rows to S3 cold storage")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Traverse the pipeline without uploading or deleting anything.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ('console' or 'json').
    #[arg(long, default_value = "console")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32, Error> {
    logging::init(&args.log_level, args.log_format.parse()?)?;

    // configuration errors abort before any I/O
    let config = Arc::new(relic_config::load_config(&args.config)?);
    let store = Arc::new(ObjectStore::new(&config.s3).await?);
    let audit = Arc::new(AuditTrail::new(config.defaults.audit_trail_storage_type));

    let (handle, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, finishing the current step and rolling back");
            handle.trigger();
        }
    });

    let summary = run_archival(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&audit),
        shutdown,
        args.dry_run,
    )
    .await;

    audit.flush(&store).await;

    println!("Archival summary");
    println!("  status:    {}{}", summary.status, if args.dry_run { " (dry-run)" } else { "" });
    println!(
        "  databases: {} processed, {} failed",
        summary.databases_processed, summary.databases_failed
    );
    println!(
        "  tables:    {} processed, {} failed, {} skipped",
        summary.tables_processed, summary.tables_failed, summary.tables_skipped
    );
    println!(
        "  records:   {} archived this run ({} total)",
        summary.records_archived_this_run, summary.records_archived_total
    );
    println!("  batches:   {}", summary.batches_processed);
    println!("  elapsed:   {:.1}s", summary.elapsed_seconds());
    for db in &summary.database_stats {
        if let Some(error) = &db.error {
            println!("  {}: {:?} - {}", db.database, db.status, error);
        }
    }

    Ok(if summary.interrupted {
        130
    } else {
        match summary.status {
            relic_api_types::RunStatus::Success => 0,
            _ => 1,
        }
    })
}

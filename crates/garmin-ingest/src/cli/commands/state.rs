//! Inspect and override sync state

use super::{single_owner, Overrides};
use crate::config::parse_date;
use crate::error::Result;
use crate::models::MetricKind;
use crate::storage::SyncDb;

/// Print every stored watermark
pub async fn status(overrides: &Overrides) -> Result<()> {
    let config = overrides.load()?;
    let path = config.state_db_path();

    if !path.exists() {
        println!("No sync state found at: {}", path.display());
        println!("Run 'garmin-ingest sync' to create it.");
        return Ok(());
    }

    let db = SyncDb::open(&path)?;
    let rows = db.list_watermarks()?;
    println!("Sync state: {}", path.display());
    println!();
    if rows.is_empty() {
        println!("Nothing committed yet.");
        return Ok(());
    }

    println!("{:<20} {:<18} {}", "Identity", "Kind", "Committed through");
    println!("{}", "-".repeat(58));
    for row in rows {
        println!(
            "{:<20} {:<18} {}",
            row.owner.as_deref().unwrap_or("-"),
            row.kind,
            row.committed_through
        );
    }
    Ok(())
}

/// Move a kind's watermark back to `to`, or clear it so the next run starts over
pub async fn reset(kind: &str, to: Option<String>, overrides: &Overrides) -> Result<()> {
    let config = overrides.load()?;
    let kind: MetricKind = kind.parse()?;
    let to = to.as_deref().map(parse_date).transpose()?;
    let owner = single_owner(&config)?;

    let db = SyncDb::open(config.state_db_path())?;
    db.reset(owner.as_deref(), kind, to)?;

    match to {
        Some(date) => println!("Watermark for {} set to {}", kind, date),
        None => println!("Watermark for {} cleared", kind),
    }
    Ok(())
}

pub mod import;
pub mod state;
pub mod sync;

pub use import::{export as import_export, fit as import_fit};
pub use state::{reset, status};
pub use sync::run as sync_run;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{parse_date, IngestConfig};
use crate::error::{IngestError, Result};

/// Command line values layered over the configuration file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub profile: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub lenient: bool,
}

impl Overrides {
    /// Load the configuration file and apply the flags on top
    pub fn load(&self) -> Result<IngestConfig> {
        let mut config = IngestConfig::load_or_default(self.config.as_deref())?;
        if let Some(profile) = &self.profile {
            config.profile = Some(profile.clone());
        }
        if let Some(start) = &self.start {
            config.start_date = Some(parse_date(start)?);
        }
        if let Some(end) = &self.end {
            config.end_date = Some(parse_date(end)?);
        }
        config.lenient |= self.lenient;
        Ok(config)
    }
}

/// The one identity a local import belongs to
fn single_owner(config: &IngestConfig) -> Result<Option<String>> {
    match config.identities().as_slice() {
        [owner] => Ok(owner.clone()),
        _ => Err(IngestError::config(
            "local imports belong to one account; list exactly one user in multi-user mode",
        )),
    }
}

/// Set `flag` on the first Ctrl-C so the run stops at the next boundary
fn stop_on_ctrl_c(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current window");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

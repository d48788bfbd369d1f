//! Run outcome reporting

use std::fmt;

/// One skipped window or file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    /// Window (`"heart_rate 2024-01-01..2024-01-01"`) or file label
    pub identifier: String,
    pub reason: String,
}

/// Final status of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    FullySynced,
    PartiallySynced { skips: usize },
    Aborted(String),
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::FullySynced => write!(f, "fully synced"),
            RunStatus::PartiallySynced { skips } => {
                write!(f, "partially synced with {} skip{}", skips, if *skips == 1 { "" } else { "s" })
            }
            RunStatus::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

/// Counters and skips collected over a run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub windows_committed: usize,
    pub files_imported: usize,
    pub files_already_known: usize,
    pub records_written: usize,
    pub skips: Vec<Skip>,
    aborted: Option<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a skipped window or file and log it
    pub fn skip(&mut self, identifier: impl Into<String>, reason: impl Into<String>) {
        let skip = Skip {
            identifier: identifier.into(),
            reason: reason.into(),
        };
        log::warn!("Skipped {}: {}", skip.identifier, skip.reason);
        self.skips.push(skip);
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("Run aborted: {}", reason);
        self.aborted = Some(reason);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn status(&self) -> RunStatus {
        match (&self.aborted, self.skips.len()) {
            (Some(reason), _) => RunStatus::Aborted(reason.clone()),
            (None, 0) => RunStatus::FullySynced,
            (None, skips) => RunStatus::PartiallySynced { skips },
        }
    }

    /// Fold a later phase of the same run into this report
    pub fn merge(&mut self, other: RunReport) {
        self.windows_committed += other.windows_committed;
        self.files_imported += other.files_imported;
        self.files_already_known += other.files_already_known;
        self.records_written += other.records_written;
        self.skips.extend(other.skips);
        if other.aborted.is_some() {
            self.aborted = other.aborted;
        }
    }

    /// Multi-line summary for the operator
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Status: {}\nWindows committed: {}\nRecords written: {}",
            self.status(),
            self.windows_committed,
            self.records_written
        );
        if self.files_imported > 0 || self.files_already_known > 0 {
            out.push_str(&format!(
                "\nFiles imported: {}\nFiles already known: {}",
                self.files_imported, self.files_already_known
            ));
        }
        for skip in &self.skips {
            out.push_str(&format!("\n  skipped {}: {}", skip.identifier, skip.reason));
        }
        out
    }
}

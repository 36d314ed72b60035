use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};

use crate::error::{ReportError, Result};
use crate::indexer::ReportFile;

/// Same layout as the key embedded in report file names.
pub const KEY_FORMAT: &str = "%Y%m%d%H%M";

#[derive(Clone, Debug)]
pub struct WindowSplit {
    pub cutoff: String,
    /// Most recent first.
    pub within: Vec<ReportFile>,
    pub stale: Vec<ReportFile>,
}

/// Renders `now - hours` as a 12-digit key. Seconds are truncated, so the bound is minute-granular.
pub fn cutoff_key(now: DateTime<Utc>, hours: f64) -> Result<String> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(ReportError::InvalidSelection { selector: hours.to_string(), details: "time window must be a non-negative number of hours".into() });
    }
    let ms = (hours * 3_600_000.0).round() as i64;
    let cutoff = Duration::try_milliseconds(ms).and_then(|d| now.checked_sub_signed(d));
    Ok(match cutoff {
        Some(t) => t.format(KEY_FORMAT).to_string(),
        None => "000000000000".to_string(),
    })
}

/// Splits `files` around the cutoff; a key equal to the cutoff is inside the window.
pub fn partition(files: &[ReportFile], hours: f64, now: DateTime<Utc>) -> Result<WindowSplit> {
    let cutoff = cutoff_key(now, hours)?;
    let (mut within, stale): (Vec<ReportFile>, Vec<ReportFile>) = files.iter().cloned().partition(|f| f.timestamp_key.as_str() >= cutoff.as_str());
    within.sort_by(|a, b| b.timestamp_key.cmp(&a.timestamp_key).then_with(|| a.path.cmp(&b.path)));
    log::debug!("Window cutoff {}: {} within, {} stale", cutoff, within.len(), stale.len());
    Ok(WindowSplit { cutoff, within, stale })
}

#[derive(Debug, Default)]
pub struct PruneOutcome {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<ReportError>,
    pub dry_run: bool,
}

/// Permanently deletes every stale report. A failed removal is recorded and the rest still run.
pub fn prune(stale: &[ReportFile], dry_run: bool) -> PruneOutcome {
    let mut out = PruneOutcome { dry_run, ..Default::default() };
    for f in stale {
        if dry_run {
            log::info!("Would delete {}", f.path.display());
            out.removed.push(f.path.clone());
            continue;
        }
        match std::fs::remove_file(&f.path) {
            Ok(_) => { log::info!("Deleted {}", f.path.display()); out.removed.push(f.path.clone()); }
            Err(source) => {
                let e = ReportError::DeletionFailure { path: f.path.clone(), source };
                log::error!("{}", e);
                out.failures.push(e);
            }
        }
    }
    out
}

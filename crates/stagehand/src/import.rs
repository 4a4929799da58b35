//! Import orchestrator: push a scene file's parameters back into the live
//! console, paced so the console keeps up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use showfile::manifest::section_label_for;
use x32osc::{Broadcast, X32Session};

use crate::bus::EventBus;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Minimum gap between successive sets.
    pub send_gap: Duration,
    /// Progress event cadence.
    pub progress_every: usize,
    /// Window for the closing liveness probe.
    pub confirm_timeout: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            send_gap: Duration::from_millis(5),
            progress_every: 25,
            confirm_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportReport {
    pub parameter_count: usize,
    pub duration_ms: u64,
    /// Local send failures; sets are otherwise unacknowledged.
    pub error_count: usize,
    /// The closing liveness probe went unanswered.
    pub uncertain: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("scene file rejected: {0}")]
    Parse(#[from] showfile::ShowfileError),
    #[error("import canceled after {completed} of {total} parameters")]
    Canceled { completed: usize, total: usize },
}

/// Parse `text` and write every record to the console.
///
/// A firmware mismatch between the file and the console is a warning, not
/// a failure — the console ignores addresses it does not know. The result
/// is `uncertain` when the console stays silent for the closing probe.
pub async fn import_scene(
    session: &Arc<X32Session>,
    bus: &EventBus,
    text: &str,
    options: &ImportOptions,
    cancel: &CancellationToken,
) -> Result<ImportReport, ImportError> {
    let started = Instant::now();
    let (header, records) = showfile::read(text)?;
    let total = records.len();

    if let Some(identity) = session.identity().await {
        let file_major = header.firmware.split('.').next().and_then(|s| s.parse::<u32>().ok());
        if let (Some(file_major), Some(console_major)) =
            (file_major, identity.firmware_major())
        {
            if file_major != console_major {
                let message = format!(
                    "scene file firmware {} does not match console firmware {}",
                    header.firmware, identity.firmware
                );
                warn!("{}", message);
                bus.publish(Broadcast::warning(message));
            }
        }
    }

    info!("importing {} parameters (\"{}\")", total, header.name);

    let mut error_count = 0usize;
    for (index, record) in records.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ImportError::Canceled {
                completed: index,
                total,
            });
        }
        if index > 0 && !options.send_gap.is_zero() {
            tokio::time::sleep(options.send_gap).await;
        }

        if let Err(e) = session.command(&record.address, record.values.clone()).await {
            warn!("import send failed for {}: {}", record.address, e);
            error_count += 1;
        }

        let completed = index + 1;
        if completed % options.progress_every == 0 || completed == total {
            bus.publish(Broadcast::ImportProgress {
                completed,
                total,
                section: section_label_for(&record.address),
            });
        }
    }

    // One identity round trip confirms the console survived the flood.
    let uncertain = session.identity_query(options.confirm_timeout).await.is_err();
    if uncertain {
        let message = "console silent after import; load uncertain";
        warn!("{}", message);
        bus.publish(Broadcast::warning(message));
    }

    let report = ImportReport {
        parameter_count: total,
        duration_ms: started.elapsed().as_millis() as u64,
        error_count,
        uncertain,
    };
    info!(
        "import complete: {} parameters in {} ms ({} send errors)",
        report.parameter_count, report.duration_ms, report.error_count
    );
    Ok(report)
}

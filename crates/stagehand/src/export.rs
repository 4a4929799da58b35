//! Export orchestrator: walk the parameter manifest, sweep the console,
//! serialize a scene or full-backup file.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use showfile::manifest::Manifest;
use showfile::{SceneHeader, SceneRecord};
use x32osc::{sweep, Broadcast, SweepError, SweepPolicy, X32Session};

use crate::bus::EventBus;

/// Name and notes for the produced file's header.
#[derive(Debug, Clone)]
pub struct ExportMeta {
    pub name: String,
    pub notes: String,
}

impl ExportMeta {
    pub fn new(name: &str, notes: &str) -> Self {
        Self {
            name: name.to_string(),
            notes: notes.to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExportSummary {
    pub parameter_count: usize,
    pub duration_ms: u64,
    /// Addresses that never answered and were written value-less.
    pub error_count: usize,
}

#[derive(Debug)]
pub struct ExportOutcome {
    pub text: String,
    pub summary: ExportSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export canceled after {completed} of {total} parameters")]
    Canceled { completed: usize, total: usize },
    #[error("session lost mid-export: {reason}")]
    SessionLost {
        reason: String,
        completed: usize,
        total: usize,
    },
    #[error(transparent)]
    Session(#[from] x32osc::SessionError),
}

/// Sweep tuning for exports: a small window and generous timeout keep the
/// console comfortable; the cadence keeps progress events off the hot path.
pub fn export_policy() -> SweepPolicy {
    SweepPolicy::default()
        .with_timeout(Duration::from_millis(500))
        .with_attempts(3)
        .with_window(4)
        .with_gap(Duration::from_millis(2))
        .with_progress_every(25)
}

/// Produce a single-scene file.
pub async fn export_scene(
    session: &Arc<X32Session>,
    bus: &EventBus,
    meta: ExportMeta,
    policy: SweepPolicy,
    cancel: &CancellationToken,
) -> Result<ExportOutcome, ExportError> {
    run(session, bus, Manifest::scene(), meta, policy, cancel).await
}

/// Produce a full-console backup file: every scene and snippet slot header,
/// the library banks and the current surface state on top of the scene
/// parameters.
pub async fn export_console_backup(
    session: &Arc<X32Session>,
    bus: &EventBus,
    meta: ExportMeta,
    policy: SweepPolicy,
    cancel: &CancellationToken,
) -> Result<ExportOutcome, ExportError> {
    run(session, bus, Manifest::full_backup(), meta, policy, cancel).await
}

async fn run(
    session: &Arc<X32Session>,
    bus: &EventBus,
    manifest: Manifest,
    meta: ExportMeta,
    policy: SweepPolicy,
    cancel: &CancellationToken,
) -> Result<ExportOutcome, ExportError> {
    let started = Instant::now();

    // Fresh identity for the header firmware; fall back to the last one
    // seen if the console is momentarily quiet.
    let identity = match session.identity_query(Duration::from_secs(2)).await {
        Ok(identity) => identity,
        Err(e) => match session.identity().await {
            Some(identity) => identity,
            None => return Err(e.into()),
        },
    };

    let entries: Vec<(String, String)> = manifest
        .entries()
        .map(|(label, addr)| (label.to_string(), addr.to_string()))
        .collect();
    let addresses: Vec<String> = entries.iter().map(|(_, addr)| addr.clone()).collect();
    let total = addresses.len();

    info!(
        "exporting {} parameters from {} ({})",
        total, identity.name, identity.firmware
    );

    let progress = |completed: usize, total: usize| {
        let section = entries[completed - 1].0.clone();
        bus.publish(Broadcast::ExportProgress {
            completed,
            total,
            section,
        });
    };

    let items = match sweep(session, &addresses, &policy, progress, cancel).await {
        Ok(items) => items,
        Err(SweepError::Canceled { partial, total }) => {
            return Err(ExportError::Canceled {
                completed: partial.len(),
                total,
            })
        }
        Err(SweepError::SessionLost {
            reason,
            partial,
            total,
        }) => {
            bus.publish(Broadcast::error(format!("export aborted: {}", reason)));
            return Err(ExportError::SessionLost {
                reason,
                completed: partial.len(),
                total,
            });
        }
    };

    let error_count = items.iter().filter(|item| item.is_missing()).count();
    if error_count > 0 {
        warn!(
            "{} of {} parameters never answered; written value-less",
            error_count, total
        );
    }

    // A value-less line on re-import leaves the console's prior value in
    // place, so exhausted addresses degrade gracefully.
    let records: Vec<SceneRecord> = items
        .into_iter()
        .map(|item| SceneRecord::new(item.address, item.values.unwrap_or_default()))
        .collect();

    let header = SceneHeader::new(&identity.firmware, &meta.name, &meta.notes);
    let text = showfile::write(&header, &records);
    let summary = ExportSummary {
        parameter_count: records.len(),
        duration_ms: started.elapsed().as_millis() as u64,
        error_count,
    };

    info!(
        "export complete: {} parameters in {} ms ({} missing)",
        summary.parameter_count, summary.duration_ms, summary.error_count
    );

    Ok(ExportOutcome { text, summary })
}

//! Scene store: one sandboxed directory of backup files unified with the
//! console's 100 scene slots.
//!
//! Identity rules: an on-device slot is `device-<index>`, a backup-only
//! file is `local-<stem>`, and when a slot name matches a file stem
//! case-insensitively the two merge into one record with `origin = both`.
//! Every filename crossing this module's boundary passes the sanitizer;
//! nothing outside the sandbox directory is ever read, written or deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use showfile::manifest::{self, SLOTS};
use x32osc::{
    sweep, Broadcast, OscValue, SceneLoadSource, SweepPolicy, X32Session, RECALL_ADDRESS,
};

use crate::bus::EventBus;
use crate::export::{self, ExportMeta};
use crate::import::{self, ImportOptions, ImportReport};
use crate::SharedSession;

/// How long one list result may serve concurrent callers.
const LIST_CACHE_TTL: Duration = Duration::from_millis(1000);

/// File extension for single-scene backups.
pub const SCENE_EXT: &str = "scn";

/// File extension for full-console backups.
pub const BACKUP_EXT: &str = "bak";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid filename")]
    InvalidFilename,
    #[error("Invalid filename")]
    PathEscape,
    #[error("no stored scene with id {0}")]
    NotFound(String),
    #[error("{0}")]
    Unsupported(&'static str),
    #[error("storage error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] x32osc::SessionError),
    #[error(transparent)]
    Export(#[from] export::ExportError),
    #[error(transparent)]
    Import(#[from] import::ImportError),
}

/// Where a stored scene lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneOrigin {
    Device,
    Local,
    Both,
}

/// One row of the unified scene view.
#[derive(Debug, Clone, Serialize)]
pub struct SceneEntry {
    pub id: String,
    pub name: String,
    /// Console slot index; `None` for disk-only entries.
    pub slot: Option<u32>,
    pub origin: SceneOrigin,
    pub modified: Option<DateTime<Utc>>,
    pub has_backup: bool,
    pub notes: String,
    /// Backing file name inside the sandbox, when one exists.
    pub file: Option<String>,
}

/// Reject anything that could name a path outside the sandbox, strip
/// control characters. Idempotent: sanitizing a sanitized name is a no-op.
pub fn sanitize_filename(name: &str) -> Result<String, StoreError> {
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(StoreError::PathEscape);
    }
    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned == "." {
        return Err(StoreError::InvalidFilename);
    }
    Ok(cleaned)
}

/// Sanitize `name` and resolve it under `root`, asserting the resolved
/// path (for existing files, after symlinks) stays inside.
pub fn resolve_under(root: &Path, name: &str) -> Result<PathBuf, StoreError> {
    let cleaned = sanitize_filename(name)?;
    let path = root.join(&cleaned);
    if path.exists() {
        let canonical = path.canonicalize()?;
        if !canonical.starts_with(root) {
            return Err(StoreError::PathEscape);
        }
    }
    Ok(path)
}

struct ListCache {
    at: Instant,
    entries: Vec<SceneEntry>,
}

pub struct SceneStore {
    root: PathBuf,
    session: SharedSession,
    bus: EventBus,
    cache: Mutex<Option<ListCache>>,
}

impl SceneStore {
    /// Open (and create if needed) the sandbox directory.
    pub fn open(root: &Path, session: SharedSession, bus: EventBus) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            session,
            bus,
            cache: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn session(&self) -> Arc<X32Session> {
        self.session.read().await.clone()
    }

    /// Unified view over device slots and backup files.
    ///
    /// The cache lock is held across the build so a burst of concurrent
    /// callers produces one device sweep, not many.
    pub async fn list(&self) -> Result<Vec<SceneEntry>, StoreError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() <= LIST_CACHE_TTL {
                return Ok(cached.entries.clone());
            }
        }
        let entries = self.build_list().await?;
        *cache = Some(ListCache {
            at: Instant::now(),
            entries: entries.clone(),
        });
        Ok(entries)
    }

    pub async fn get(&self, id: &str) -> Result<SceneEntry, StoreError> {
        self.list()
            .await?
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Write a fresh backup file with a header only. The console itself is
    /// not touched.
    pub async fn save(&self, name: &str, notes: &str) -> Result<SceneEntry, StoreError> {
        let filename = ensure_ext(sanitize_filename(name)?, SCENE_EXT);
        let path = resolve_under(&self.root, &filename)?;
        let stem = file_stem(&filename);

        let firmware = self
            .session()
            .await
            .identity()
            .await
            .map(|identity| identity.firmware)
            .unwrap_or_else(|| "4.08".to_string());
        let header = showfile::SceneHeader::new(&firmware, &stem, notes);
        tokio::fs::write(&path, showfile::write(&header, &[])).await?;
        info!("saved scene template {}", filename);

        self.invalidate().await;
        // The new file may have merged with a device slot of the same name.
        self.list()
            .await?
            .into_iter()
            .find(|entry| entry.file.as_deref() == Some(filename.as_str()))
            .ok_or(StoreError::NotFound(format!("local-{}", stem)))
    }

    /// Delete the backing file of a local or merged entry. On-device slots
    /// cannot be erased from here.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let entry = self.get(id).await?;
        if entry.origin == SceneOrigin::Device {
            return Err(StoreError::Unsupported(
                "on-device scene slots cannot be deleted",
            ));
        }
        let Some(file) = entry.file else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let path = resolve_under(&self.root, &file)?;
        tokio::fs::remove_file(&path).await?;
        info!("deleted scene backup {}", file);
        self.invalidate().await;
        Ok(())
    }

    /// Apply a stored scene: recall the slot for device-backed entries,
    /// replay the backup file for disk-only ones.
    pub async fn load(&self, id: &str) -> Result<Option<ImportReport>, StoreError> {
        let entry = self.get(id).await?;
        let session = self.session().await;

        let report = if let Some(slot) = entry.slot {
            session
                .command(RECALL_ADDRESS, vec![OscValue::Int(slot as i32)])
                .await?;
            info!("recalled scene slot {} ({})", slot, entry.name);
            self.bus.publish(Broadcast::SceneLoaded {
                slot: Some(slot as i32),
                source: SceneLoadSource::Manager,
            });
            None
        } else {
            let Some(file) = entry.file else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            let path = resolve_under(&self.root, &file)?;
            let text = tokio::fs::read_to_string(&path).await?;
            let report = import::import_scene(
                &session,
                &self.bus,
                &text,
                &ImportOptions::default(),
                &CancellationToken::new(),
            )
            .await?;
            self.bus.publish(Broadcast::SceneLoaded {
                slot: None,
                source: SceneLoadSource::Manager,
            });
            Some(report)
        };

        self.invalidate_cache().await;
        Ok(report)
    }

    /// Export a device slot's current content into the sandbox.
    pub async fn backup(&self, id: &str) -> Result<SceneEntry, StoreError> {
        let entry = self.get(id).await?;
        let Some(slot) = entry.slot else {
            return Err(StoreError::Unsupported(
                "only on-device scene slots can be backed up",
            ));
        };
        let session = self.session().await;

        let name = if entry.name.is_empty() {
            format!("scene-{:03}", slot)
        } else {
            entry.name.clone()
        };
        let outcome = export::export_scene(
            &session,
            &self.bus,
            ExportMeta::new(&name, &entry.notes),
            export::export_policy(),
            &CancellationToken::new(),
        )
        .await?;

        let filename = ensure_ext(sanitize_filename(&name)?, SCENE_EXT);
        let path = resolve_under(&self.root, &filename)?;
        tokio::fs::write(&path, outcome.text).await?;
        info!(
            "backed up slot {} to {} ({} parameters)",
            slot, filename, outcome.summary.parameter_count
        );

        self.invalidate().await;
        self.get(id).await
    }

    /// Drop the cache and tell clients the stored-scene view changed.
    async fn invalidate(&self) {
        self.invalidate_cache().await;
        self.bus.publish(Broadcast::SceneListInvalidated);
    }

    async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    async fn build_list(&self) -> Result<Vec<SceneEntry>, StoreError> {
        let mut entries = self.device_entries().await;

        let mut by_name: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.name.to_lowercase(), index))
            .collect();

        let mut locals = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCENE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };
            let Some(file) = path.file_name().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };

            let modified = dirent
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            let notes = read_notes(&path).await;

            if let Some(&index) = by_name.get(&stem.to_lowercase()) {
                if index < entries.len() {
                    let entry = &mut entries[index];
                    entry.origin = SceneOrigin::Both;
                    entry.has_backup = true;
                    entry.modified = modified;
                    entry.file = Some(file);
                }
            } else {
                // Sentinel keeps a second file with the same stem (case
                // difference) from merging into a device slot twice.
                by_name.insert(stem.to_lowercase(), usize::MAX);
                locals.push(SceneEntry {
                    id: format!("local-{}", stem),
                    name: stem,
                    slot: None,
                    origin: SceneOrigin::Local,
                    modified,
                    has_backup: true,
                    notes,
                    file: Some(file),
                });
            }
        }

        locals.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        entries.extend(locals);
        Ok(entries)
    }

    /// Enumerate non-empty device slots: one name and one notes query per
    /// slot, driven through the sweep engine.
    async fn device_entries(&self) -> Vec<SceneEntry> {
        let session = self.session().await;
        if !session.connection_state().is_live() {
            debug!("session not live; listing local backups only");
            return Vec::new();
        }

        let addresses: Vec<String> = (0..SLOTS)
            .flat_map(|slot| [manifest::scene_slot_name(slot), manifest::scene_slot_notes(slot)])
            .collect();
        let policy = SweepPolicy::default()
            .with_timeout(Duration::from_millis(500))
            .with_attempts(2)
            .with_window(4)
            .with_gap(Duration::from_millis(2));
        let cancel = CancellationToken::new();

        let items = match sweep(&session, &addresses, &policy, |_, _| {}, &cancel).await {
            Ok(items) => items,
            Err(e) => {
                warn!("device slot enumeration failed: {}", e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for (slot, pair) in items.chunks(2).enumerate() {
            let name = pair
                .first()
                .and_then(|item| item.values.as_ref())
                .and_then(|values| values.first())
                .and_then(OscValue::as_str)
                .unwrap_or_default()
                .to_string();
            // An empty name means the slot is unused.
            if name.is_empty() {
                continue;
            }
            let notes = pair
                .get(1)
                .and_then(|item| item.values.as_ref())
                .and_then(|values| values.first())
                .and_then(OscValue::as_str)
                .unwrap_or_default()
                .to_string();
            entries.push(SceneEntry {
                id: format!("device-{}", slot),
                name,
                slot: Some(slot as u32),
                origin: SceneOrigin::Device,
                modified: None,
                has_backup: false,
                notes,
                file: None,
            });
        }
        entries
    }
}

/// Append `.ext` unless the name already carries it (case-insensitive).
pub fn ensure_ext(name: String, ext: &str) -> String {
    let suffix = format!(".{}", ext);
    if name.to_lowercase().ends_with(&suffix) {
        name
    } else {
        format!("{}{}", name, suffix)
    }
}

fn file_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string()
}

/// Notes field from a backup file's header, best effort.
async fn read_notes(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => showfile::read(&text)
            .map(|(header, _)| header.notes)
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizer_rejects_escapes() {
        assert!(matches!(
            sanitize_filename("../etc/passwd"),
            Err(StoreError::PathEscape)
        ));
        assert!(matches!(
            sanitize_filename("/etc/passwd"),
            Err(StoreError::PathEscape)
        ));
        assert!(matches!(
            sanitize_filename("a/b.scn"),
            Err(StoreError::PathEscape)
        ));
        assert!(matches!(
            sanitize_filename("a\\b.scn"),
            Err(StoreError::PathEscape)
        ));
        assert!(matches!(
            sanitize_filename("foo..scn"),
            Err(StoreError::PathEscape)
        ));
    }

    #[test]
    fn sanitizer_rejects_empty_and_control() {
        assert!(matches!(
            sanitize_filename(""),
            Err(StoreError::InvalidFilename)
        ));
        assert!(matches!(
            sanitize_filename("\u{7}\u{8}"),
            Err(StoreError::InvalidFilename)
        ));
    }

    #[test]
    fn sanitizer_is_idempotent() {
        let once = sanitize_filename("FOH Main\u{7}.scn").unwrap();
        let twice = sanitize_filename(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, "FOH Main.scn");
    }

    #[test]
    fn ext_is_appended_once() {
        assert_eq!(ensure_ext("foh".into(), "scn"), "foh.scn");
        assert_eq!(ensure_ext("foh.scn".into(), "scn"), "foh.scn");
        assert_eq!(ensure_ext("FOH.SCN".into(), "scn"), "FOH.SCN");
    }
}

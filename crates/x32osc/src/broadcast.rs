//! Events published by the session and the orchestration layers.
//!
//! One enum covers everything a subscriber (the WebSocket fan-out, tests)
//! can observe; the serde tagging produces the `{"type": ...}` shape the
//! browser client consumes.

use serde::{Deserialize, Serialize};

use crate::session::ConnectionState;

/// Fan-out event. Delivery order within one publisher matches emission
/// order; a slow subscriber sees a lag marker instead of blocking anyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Broadcast {
    /// The session's connection state machine transitioned.
    StateChange { state: ConnectionState },
    /// The console recalled a scene, or a manager-driven load completed.
    SceneLoaded { slot: Option<i32>, source: SceneLoadSource },
    /// The stored-scene view changed; clients should re-list.
    SceneListInvalidated,
    ExportProgress {
        completed: usize,
        total: usize,
        section: String,
    },
    ImportProgress {
        completed: usize,
        total: usize,
        section: String,
    },
    /// A user-facing error or warning from any component.
    Error { message: String, warning: bool },
}

/// Where a scene-loaded event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneLoadSource {
    /// Spontaneous `/-show/prepos/current` update from the console.
    Console,
    /// A load driven through the scene store.
    Manager,
}

impl Broadcast {
    /// Stable kind string, usable for subscribe-by-kind filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Broadcast::StateChange { .. } => "state_change",
            Broadcast::SceneLoaded { .. } => "scene_loaded",
            Broadcast::SceneListInvalidated => "scene_list_invalidated",
            Broadcast::ExportProgress { .. } => "export_progress",
            Broadcast::ImportProgress { .. } => "import_progress",
            Broadcast::Error { .. } => "error",
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Broadcast::Error {
            message: message.into(),
            warning: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Broadcast::Error {
            message: message.into(),
            warning: false,
        }
    }
}

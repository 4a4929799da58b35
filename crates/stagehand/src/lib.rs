//! Scene manager daemon for Behringer X32 consoles.
//!
//! Wires the protocol layer into the operator-facing services: bulk
//! export/import of console state, a unified view over on-device scene
//! slots and on-disk backups, and the HTTP/WebSocket surface the browser
//! UI consumes.

use std::sync::Arc;

use tokio::sync::RwLock;
use x32osc::X32Session;

pub mod bus;
pub mod discover;
pub mod export;
pub mod import;
pub mod store;
pub mod web;
pub mod ws;

/// The daemon's one active session, swappable by `POST /x32/connect`.
pub type SharedSession = Arc<RwLock<Arc<X32Session>>>;

pub fn shared_session(session: Arc<X32Session>) -> SharedSession {
    Arc::new(RwLock::new(session))
}

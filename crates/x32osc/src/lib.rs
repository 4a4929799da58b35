//! Protocol layer for Behringer X32 consoles: OSC 1.0 wire codec, a
//! reactor-based UDP session with address-keyed request/reply correlation,
//! a paced bulk query engine, and an in-process console emulator.

pub mod broadcast;
pub mod mock;
pub mod osc;
pub mod session;
pub mod sweep;

pub use broadcast::{Broadcast, SceneLoadSource};
pub use osc::{OscError, OscMessage, OscValue};
pub use session::{
    ConnectionState, ConsoleIdentity, SessionConfig, SessionError, StateTracker, X32Session,
    CURRENT_SCENE_ADDRESS, DEFAULT_CONSOLE_PORT, IDENTITY_ADDRESS, RECALL_ADDRESS,
};
pub use sweep::{sweep, SweepError, SweepItem, SweepPolicy};

//! The console's scene/backup text format and the parameter manifest that
//! drives full exports.
//!
//! Files written here are what the console itself consumes over USB: a
//! `.scn` file carries one scene, a `.bak` file carries the whole desk.
//! Both share the same grammar — a header line, then one line per
//! parameter.

pub mod codec;
pub mod manifest;

pub use codec::{read, write, SceneHeader, SceneRecord, ShowfileError};
pub use manifest::{section_label_for, Manifest, ManifestSection};

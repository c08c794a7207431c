//! Live mirroring of the local tree.
//!
//! - `state`: event state machine (atomic-save and rename pairing)
//! - `watcher`: notify watcher feeding a bounded queue, rename-half pairing
//! - `engine`: the session tying bootstrap, watcher and transport together

pub mod engine;
pub mod state;
pub mod watcher;

pub use engine::{SyncOptions, SyncSession};
pub use state::{swap_target, Action, EventKind, FileEvent, LocalFs, RealFs, SyncMode, SyncState};
pub use watcher::{map_event, EventStream, EventWatcher, RenameJoiner};

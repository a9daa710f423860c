//! Memory tier.
//!
//! The event log runs perpendicular to everything: user-visible actions are
//! appended to a durable journal immediately, and the consolidator reads
//! that journal on its schedule to update long-term memory.

mod consolidator;
mod event_log;
mod store;

pub use consolidator::{Consolidator, ConsolidationSummary, TICK_SECONDS};
pub use event_log::{EventKind, EventLog, MemoryEvent};
pub use store::{
    ArchivalEntry, CoreMemoryEntry, MemoryImportance, MemoryStore, RecallEntry, UserSignal,
};

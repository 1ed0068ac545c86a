//! Session state store, trace identities and the explicit execution context.

mod context;
mod session;
mod trace;

pub use context::{CancelFlag, ExecutionContext};
pub use session::{
    EntryKind, ErrorEntry, HistoryEntry, LineageEntry, SessionFork, SessionState,
};
pub use trace::TraceNode;

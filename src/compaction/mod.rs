//! Context Compression
//!
//! Keeps the message list sent on each turn bounded without ever discarding
//! the phase's real history.
//!
//! ## Modes
//!
//! - **Tiered**: turns older than a trailing window are compressed per message.
//!   Error-mentioning messages stay verbatim, large tool results become a
//!   type/size/hash placeholder, tool-calling assistant messages collapse to the
//!   tool names plus a preview, long reasoning is truncated with a marker.
//!   User and system messages are kept.
//! - **Loop-retry**: on a validation retry the accreted history is dropped and
//!   rebuilt from system prompts, the original task, the last few failures and
//!   the retry instruction, so context does not grow with the attempt count.
//!
//! ## Configuration
//!
//! ```toml
//! [context]
//! window_turns = 2
//! min_tool_result_chars = 400
//! loop_history_limit = 3
//! ```

mod config;
mod manager;
mod tiers;

pub use config::CompressionConfig;
pub use manager::{ContextManager, ValidationFailure, loop_retry_context};
pub use tiers::{compress, compress_message, content_hash, mentions_error, window_start};

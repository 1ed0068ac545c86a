//! Dependency analysis and phase scheduling.
//!
//! The DAG layer turns a cascade definition into a dependency graph and runs
//! it in one of two modes:
//!
//! 1. **Builder** - scans `context.from`, instruction templates and factor
//!    templates for references to earlier phases
//! 2. **Scheduler** - tracks ready, running, completed, failed and skipped phases
//! 3. **Executor** - dispatches ready phases as parallel waves onto a bounded
//!    pool, or walks phases sequentially following handoffs
//!
//! ## Example
//!
//! ```no_run
//! use cascade::dag::{DagBuilder, DagScheduler};
//! use cascade::definition::{Cascade, Phase};
//!
//! # fn example() -> anyhow::Result<()> {
//! let cascade = Cascade::new(
//!     "report",
//!     vec![
//!         Phase::new("facts", "Collect facts about {{ input.topic }}"),
//!         Phase::new("quotes", "Find quotes about {{ input.topic }}"),
//!         Phase::new("write", "Combine {{ outputs.facts }} and {{ outputs.quotes }}"),
//!     ],
//! );
//!
//! let graph = DagBuilder::new(&cascade).build()?;
//! assert!(graph.is_parallel_eligible());
//!
//! // Wave 0: [facts, quotes]
//! // Wave 1: [write]
//! let waves = DagScheduler::new(graph).compute_waves();
//! assert_eq!(waves.len(), 2);
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod scheduler;
mod state;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
pub use executor::{DagExecutor, ExecutionResult, PhaseEvent, PhaseOutput, PhaseRun, PhaseWorker};
pub use scheduler::{DagScheduler, PhaseStatus};
pub use state::{CascadeResult, ExecutionTimer, PhaseResult, RunStatus, RunSummary, ScheduleMode};

//! Execution engine for multi-phase agent cascades.
//!
//! A [`Cascade`](definition::Cascade) is an ordered set of phases. The
//! [`CascadeRunner`](runner::CascadeRunner) schedules them sequentially or in
//! dependency waves, runs each phase's turn/attempt loop against an injected
//! [`Agent`](agent::Agent), and can explore several candidates per phase
//! (soundings), refine the winner (reforge), gate input and output with
//! validators (wards), and pause for human checkpoints.

pub mod agent;
pub mod audit;
pub mod checkpoint;
pub mod compaction;
pub mod config;
pub mod dag;
pub mod definition;
pub mod errors;
pub mod reforge;
pub mod runner;
pub mod soundings;
pub mod state;
pub mod template;
pub mod wards;

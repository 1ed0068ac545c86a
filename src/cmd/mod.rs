//! CLI command implementations.
//!
//! | Module     | Commands handled     |
//! |------------|----------------------|
//! | `inspect`  | `Plan`, `Validate`   |
//! | `config`   | `Config`             |

pub mod inspect;
pub mod config;

pub use inspect::{cmd_plan, cmd_validate};
pub use config::{cmd_config, resolve_config};

//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled              |
//! |----------|-------------------------------|
//! | `run`    | `Run`                         |
//! | `state`  | `Status`, `Reset`, `Budget`   |
//! | `config` | `Config`                      |

pub mod config;
pub mod run;
pub mod state;

pub use config::cmd_config;
pub use run::cmd_run;
pub use state::{cmd_budget, cmd_reset, cmd_status};

//! CLI command implementations.
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `serve`  | `Serve`                   |
//! | `unit`   | `Unit status`, `Unit stop`|
//! | `config` | `Config show`             |

pub mod config;
pub mod serve;
pub mod unit;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use unit::cmd_unit;

//! In-unit worker: owns the agent sessions for one issue and serves them over HTTP.
//!
//! | Module        | Responsibility                                             |
//! |---------------|------------------------------------------------------------|
//! | `runtime`     | `AgentRuntime` seam, `claude` CLI driver, scripted runtime |
//! | `interaction` | pause/resume of `AskUserQuestion` and `ExitPlanMode`       |
//! | `session`     | `WorkerSessionManager` and the per-turn pump               |
//! | `cache`       | JSONL transcript cache                                     |
//! | `files`       | allow-listed file reads                                    |
//! | `server`      | axum router                                                |

pub mod cache;
pub mod config;
pub mod error;
pub mod files;
pub mod interaction;
pub mod runtime;
pub mod server;
pub mod session;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use server::{SharedState, WorkerState, build_router};
pub use session::WorkerSessionManager;

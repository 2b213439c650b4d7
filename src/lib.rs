//! agentdock orchestrator.
//!
//! | Module      | Responsibility                                                |
//! |-------------|---------------------------------------------------------------|
//! | `config`    | `agentdock.toml` + environment overrides                      |
//! | `errors`    | `WorkspaceError`, `BackendError`, `ExecutionError`            |
//! | `logging`   | tracing subscriber, optional rolling file log                 |
//! | `workspace` | per-issue directories and git checkout                        |
//! | `backend`   | `ComputeBackend` lifecycle, Docker and cloud drivers          |
//! | `router`    | session id / issue id registry                                |
//! | `execution` | `ExecutionService`: start, send, interrupt, stop, idle sweep  |
//! | `api`       | HTTP handlers                                                 |
//! | `server`    | router assembly and serve loop                                |

pub mod api;
pub mod backend;
pub mod config;
pub mod errors;
pub mod execution;
pub mod logging;
pub mod router;
pub mod server;
pub mod workspace;

pub use backend::{ComputeBackend, ComputeUnit, ManagedBackend, UnitDriver};
pub use config::Config;
pub use errors::{BackendError, ExecutionError, WorkspaceError};
pub use execution::{ExecutionService, SessionStream, StartSession};
pub use router::{OrchestratorSession, SessionRouter};
pub use workspace::{Workspace, WorkspaceManager};

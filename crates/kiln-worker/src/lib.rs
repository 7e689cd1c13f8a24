//! # kiln-worker
//!
//! A spawn runner that executes build actions on pools of long-lived worker
//! processes instead of fork/exec-ing a fresh process per action.
//!
//! An action opts in with `supports-workers=1` in its execution info. Its
//! command line is split into *startup arguments* (which identify a reusable
//! worker process) and *flag files* (which carry the per-request work). The
//! runner borrows a matching worker from a pool, sends one [`WorkRequest`]
//! over the worker's stdin, reads one [`WorkResponse`] from its stdout, and
//! either returns the worker for reuse or invalidates it if anything about
//! the exchange went wrong. Actions that do not opt in are delegated to a
//! fallback [`SpawnRunner`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kiln_worker::config::RunnerConfig;
//! use kiln_worker::pool::{KeyedWorkerPool, SubprocessWorkerFactory};
//! use kiln_worker::resources::LocalResourceManager;
//! use kiln_worker::runner::WorkerSpawnRunner;
//! use kiln_worker::spawn::TracingReporter;
//!
//! # fn demo(fallback: Arc<dyn kiln_worker::spawn::SpawnRunner>) {
//! let config = RunnerConfig::default();
//! let factory = SubprocessWorkerFactory::new(config.log_dir.clone());
//! let runner = WorkerSpawnRunner::new(
//!     "/build/execroot".into(),
//!     Arc::new(KeyedWorkerPool::new(Box::new(factory))),
//!     config,
//!     Arc::new(TracingReporter),
//!     Arc::new(LocalResourceManager::new(8.0, 16 * 1024)),
//!     fallback,
//! );
//! # let _ = runner;
//! # }
//! ```
//!
//! [`WorkRequest`]: kiln_worker_proto::WorkRequest
//! [`WorkResponse`]: kiln_worker_proto::WorkResponse
//! [`SpawnRunner`]: spawn::SpawnRunner

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod flagfile;
pub mod io;
pub mod key;
pub mod pool;
pub mod request;
pub mod resources;
pub mod runner;
pub mod spawn;

pub use config::RunnerConfig;
pub use error::ExecError;
pub use key::WorkerKey;
pub use runner::WorkerSpawnRunner;
pub use spawn::{ExecutionPolicy, Spawn, SpawnResult, SpawnRunner};

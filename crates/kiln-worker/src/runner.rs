//! The persistent-worker spawn runner.
//!
//! [`WorkerSpawnRunner`] decides per spawn whether the worker strategy
//! applies, and if so drives the whole flow: acquire resources, classify
//! the command line, derive the worker key, build the request, lease a
//! worker from the pool, run the exchange, and assemble the result. Spawns
//! that did not opt in are delegated to the fallback runner.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kiln_worker_proto::{WorkRequest, WorkResponse};

use crate::config::RunnerConfig;
use crate::error::ExecError;
use crate::flagfile::classify_arguments;
use crate::io::exchange;
use crate::key::{WorkerKey, worker_files_hash};
use crate::pool::{Worker, WorkerPool};
use crate::request::build_work_request;
use crate::resources::ResourceManager;
use crate::spawn::{
    EventReporter, ExecutionPolicy, ProgressStatus, Spawn, SpawnResult, SpawnRunner, Status,
};

/// Name this runner reports progress under.
pub const RUNNER_NAME: &str = "worker";

/// Reason quoted in the warning when a spawn did not opt into workers.
pub const REASON_NO_EXECUTION_INFO: &str =
    "because the action's execution info does not contain 'supports-workers=1'";

/// A spawn runner that executes actions on pooled persistent workers.
pub struct WorkerSpawnRunner {
    exec_root: PathBuf,
    pool: Arc<dyn WorkerPool>,
    config: RunnerConfig,
    reporter: Arc<dyn EventReporter>,
    resource_manager: Arc<dyn ResourceManager>,
    fallback: Arc<dyn SpawnRunner>,
}

impl WorkerSpawnRunner {
    /// Creates a runner rooted at `exec_root`.
    #[must_use]
    pub fn new(
        exec_root: PathBuf,
        pool: Arc<dyn WorkerPool>,
        config: RunnerConfig,
        reporter: Arc<dyn EventReporter>,
        resource_manager: Arc<dyn ResourceManager>,
        fallback: Arc<dyn SpawnRunner>,
    ) -> Self {
        Self {
            exec_root,
            pool,
            config,
            reporter,
            resource_manager,
            fallback,
        }
    }

    /// Runs the worker flow once resources are held.
    async fn exec_with_resources(
        &self,
        spawn: &Spawn,
        policy: &mut dyn ExecutionPolicy,
    ) -> Result<SpawnResult, ExecError> {
        if spawn.tool_files().is_empty() {
            return Err(ExecError::NoTools {
                mnemonic: spawn.mnemonic().to_string(),
            });
        }

        let classified =
            classify_arguments(spawn.argv(), spawn.mnemonic(), &self.config.extra_flags)?;

        let tool_hash = worker_files_hash(spawn.tool_files(), policy)?;
        let inputs = policy.expand_inputs(spawn.input_files());
        let input_layout: BTreeMap<PathBuf, PathBuf> = inputs
            .iter()
            .map(|input| {
                (
                    input.exec_path().to_path_buf(),
                    self.exec_root.join(input.exec_path()),
                )
            })
            .collect();

        let key = WorkerKey::new(
            classified.startup_args,
            spawn.env().clone(),
            self.exec_root.clone(),
            spawn.mnemonic().to_string(),
            tool_hash,
            input_layout,
            spawn.output_files().clone(),
            policy.speculating(),
        );

        let request = build_work_request(
            &self.exec_root,
            &classified.flag_files,
            &inputs,
            policy,
        )?;

        let started = Instant::now();
        let response = self.exec_in_worker(&key, &request, policy).await?;
        let wall_time = started.elapsed();

        policy.stderr().write_all(&response.output)?;

        Ok(SpawnResult::new(
            Status::Success,
            response.exit_code,
            wall_time,
        ))
    }

    /// Leases a worker for `key` and runs one exchange over it.
    async fn exec_in_worker(
        &self,
        key: &WorkerKey,
        request: &WorkRequest,
        policy: &mut dyn ExecutionPolicy,
    ) -> Result<WorkResponse, ExecError> {
        let worker = self
            .pool
            .borrow(key)
            .map_err(|source| ExecError::BorrowFailed { source })?;
        let mut lease = WorkerLease::new(Arc::clone(&self.pool), key.clone(), worker);

        let response = exchange(lease.worker_mut(), key, request, policy).await?;

        lease.release();
        Ok(response)
    }
}

#[async_trait]
impl SpawnRunner for WorkerSpawnRunner {
    async fn exec(
        &self,
        spawn: &Spawn,
        policy: &mut dyn ExecutionPolicy,
    ) -> Result<SpawnResult, ExecError> {
        if !spawn.supports_workers() {
            self.reporter.warn(&format!(
                "worker strategy cannot execute this {} action, {REASON_NO_EXECUTION_INFO}",
                spawn.mnemonic()
            ));
            return self.fallback.exec(spawn, policy).await;
        }

        policy.report(ProgressStatus::Scheduling, RUNNER_NAME);
        let _resources = self
            .resource_manager
            .acquire(spawn.owner(), spawn.local_resources())
            .await?;
        policy.report(ProgressStatus::Executing, RUNNER_NAME);

        self.exec_with_resources(spawn, policy).await
    }
}

/// Exclusive hold on a borrowed worker.
///
/// Dropping the lease invalidates the worker; that is the right default for
/// every error and cancellation path, because a worker whose exchange did
/// not complete has indeterminate stream state. Only an explicit
/// [`release`](Self::release) returns the worker to the pool.
struct WorkerLease {
    pool: Arc<dyn WorkerPool>,
    key: WorkerKey,
    worker: Option<Box<dyn Worker>>,
}

impl WorkerLease {
    fn new(pool: Arc<dyn WorkerPool>, key: WorkerKey, worker: Box<dyn Worker>) -> Self {
        Self {
            pool,
            key,
            worker: Some(worker),
        }
    }

    fn worker_mut(&mut self) -> &mut dyn Worker {
        self.worker
            .as_mut()
            .expect("lease still holds its worker")
            .as_mut()
    }

    /// Hands the worker back to the pool as healthy.
    fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.put_back(&self.key, worker);
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            tracing::debug!(
                mnemonic = self.key.mnemonic(),
                "exchange did not complete, invalidating worker"
            );
            self.pool.invalidate(&self.key, worker);
        }
    }
}

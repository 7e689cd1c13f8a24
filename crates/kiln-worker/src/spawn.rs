//! Spawn descriptions and the seams around their execution.
//!
//! A [`Spawn`] is one process invocation produced by the build graph. The
//! caller hands it to a [`SpawnRunner`] together with an
//! [`ExecutionPolicy`], which bundles the per-invocation callbacks: progress
//! reporting, input metadata lookup, artifact expansion, output capture, and
//! the output-files lock.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;

/// Execution-info key an action sets to opt into the worker strategy.
pub const SUPPORTS_WORKERS: &str = "supports-workers";

/// One file consumed or produced by an action, named by its path relative to
/// the execution root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionInput {
    exec_path: PathBuf,
}

impl ActionInput {
    /// Creates an input from its exec-root-relative path.
    pub fn new(exec_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
        }
    }

    /// The exec-root-relative path of this input.
    #[must_use]
    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    /// The exec-root-relative path as a string, as it appears on the wire.
    #[must_use]
    pub fn exec_path_string(&self) -> String {
        self.exec_path.to_string_lossy().into_owned()
    }
}

/// Local resources an action reserves while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSet {
    /// CPU cores, fractional values allowed.
    pub cpu: f64,
    /// Memory in MiB.
    pub memory_mib: u64,
}

impl ResourceSet {
    /// Creates a resource set.
    #[must_use]
    pub const fn new(cpu: f64, memory_mib: u64) -> Self {
        Self { cpu, memory_mib }
    }
}

/// One process invocation specification produced by the build graph.
#[derive(Debug, Clone)]
pub struct Spawn {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    mnemonic: String,
    tool_files: Vec<ActionInput>,
    input_files: Vec<ActionInput>,
    output_files: BTreeSet<PathBuf>,
    execution_info: BTreeMap<String, String>,
    local_resources: ResourceSet,
    owner: String,
}

impl Spawn {
    /// Creates a new builder for [`Spawn`].
    #[must_use]
    pub fn builder() -> SpawnBuilder {
        SpawnBuilder::default()
    }

    /// Full command line of the action.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Environment the action runs under.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Short string identifying the action type, e.g. `"Javac"`.
    #[must_use]
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Files making up the tool itself, as opposed to the work.
    #[must_use]
    pub fn tool_files(&self) -> &[ActionInput] {
        &self.tool_files
    }

    /// Input files of the action, before artifact expansion.
    #[must_use]
    pub fn input_files(&self) -> &[ActionInput] {
        &self.input_files
    }

    /// Exec-root-relative paths the action writes.
    #[must_use]
    pub fn output_files(&self) -> &BTreeSet<PathBuf> {
        &self.output_files
    }

    /// Free-form execution requirements attached to the action.
    #[must_use]
    pub fn execution_info(&self) -> &BTreeMap<String, String> {
        &self.execution_info
    }

    /// Local resources the action reserves while it runs.
    #[must_use]
    pub fn local_resources(&self) -> ResourceSet {
        self.local_resources
    }

    /// Label of the action owning this spawn, used in diagnostics.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether the action opted into the worker strategy.
    #[must_use]
    pub fn supports_workers(&self) -> bool {
        self.execution_info
            .get(SUPPORTS_WORKERS)
            .is_some_and(|value| value == "1")
    }
}

/// Builder for [`Spawn`].
#[derive(Debug, Default)]
pub struct SpawnBuilder {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    mnemonic: Option<String>,
    tool_files: Vec<ActionInput>,
    input_files: Vec<ActionInput>,
    output_files: BTreeSet<PathBuf>,
    execution_info: BTreeMap<String, String>,
    local_resources: ResourceSet,
    owner: Option<String>,
}

impl SpawnBuilder {
    /// Set the command line.
    #[must_use]
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the mnemonic.
    #[must_use]
    pub fn mnemonic(mut self, mnemonic: impl Into<String>) -> Self {
        self.mnemonic = Some(mnemonic.into());
        self
    }

    /// Add a tool file.
    #[must_use]
    pub fn tool_file(mut self, exec_path: impl Into<PathBuf>) -> Self {
        self.tool_files.push(ActionInput::new(exec_path));
        self
    }

    /// Add an input file.
    #[must_use]
    pub fn input_file(mut self, exec_path: impl Into<PathBuf>) -> Self {
        self.input_files.push(ActionInput::new(exec_path));
        self
    }

    /// Add an output file.
    #[must_use]
    pub fn output_file(mut self, exec_path: impl Into<PathBuf>) -> Self {
        self.output_files.insert(exec_path.into());
        self
    }

    /// Add an execution-info entry.
    #[must_use]
    pub fn execution_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.execution_info.insert(key.into(), value.into());
        self
    }

    /// Set the local resource request.
    #[must_use]
    pub const fn local_resources(mut self, resources: ResourceSet) -> Self {
        self.local_resources = resources;
        self
    }

    /// Set the owning action's label.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Build the [`Spawn`].
    ///
    /// # Panics
    ///
    /// Panics if `mnemonic` is not set.
    #[must_use]
    pub fn build(self) -> Spawn {
        let mnemonic = self.mnemonic.expect("mnemonic is required");
        let owner = self.owner.unwrap_or_else(|| mnemonic.clone());
        Spawn {
            argv: self.argv,
            env: self.env,
            mnemonic,
            tool_files: self.tool_files,
            input_files: self.input_files,
            output_files: self.output_files,
            execution_info: self.execution_info,
            local_resources: self.local_resources,
            owner,
        }
    }
}

/// Coarse phase of a spawn's execution, reported to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Waiting for resources or a worker.
    Scheduling,
    /// The action is running.
    Executing,
}

/// Terminal classification of a spawn's execution.
///
/// `Success` means the runner completed its exchange and parsed a response;
/// the exit code inside the result may still be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The exchange completed and a response was parsed.
    Success,
}

/// Outcome of a completed spawn execution.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    status: Status,
    exit_code: i32,
    wall_time: Duration,
}

impl SpawnResult {
    /// Creates a result.
    #[must_use]
    pub const fn new(status: Status, exit_code: i32, wall_time: Duration) -> Self {
        Self {
            status,
            exit_code,
            wall_time,
        }
    }

    /// Terminal status of the execution.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Exit code reported by the tool.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Wall-clock duration of the exchange.
    #[must_use]
    pub const fn wall_time(&self) -> Duration {
        self.wall_time
    }

    /// Wall-clock duration in milliseconds.
    #[must_use]
    pub const fn wall_time_millis(&self) -> u128 {
        self.wall_time.as_millis()
    }
}

/// Per-invocation callbacks supplied by the caller of a [`SpawnRunner`].
pub trait ExecutionPolicy: Send {
    /// Reports a progress transition, tagged with the runner's name.
    fn report(&mut self, status: ProgressStatus, runner: &str);

    /// Whether this invocation races another runner for the same action.
    fn speculating(&self) -> bool;

    /// Expands aggregate artifacts in `inputs` into concrete files.
    fn expand_inputs(&self, inputs: &[ActionInput]) -> Vec<ActionInput>;

    /// Content digest of an input, or `None` when metadata has no digest.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata for the input cannot be read.
    fn input_digest(&self, input: &ActionInput) -> std::io::Result<Option<Vec<u8>>>;

    /// Marks the spawn's outputs as authoritative for the build graph.
    ///
    /// Called at most once per invocation, after a response parse attempt
    /// succeeded.
    fn lock_output_files(&mut self);

    /// Stream receiving the action's stderr output.
    fn stderr(&mut self) -> &mut (dyn Write + Send);
}

/// A runner capable of executing spawns; the fallback seam.
#[async_trait]
pub trait SpawnRunner: Send + Sync {
    /// Executes one spawn to completion.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] describing why the spawn could not be
    /// executed. A tool-level failure is not an error: it comes back as a
    /// [`SpawnResult`] with a non-zero exit code.
    async fn exec(
        &self,
        spawn: &Spawn,
        policy: &mut dyn ExecutionPolicy,
    ) -> Result<SpawnResult, ExecError>;
}

/// Sink for user-facing warnings emitted outside the policy.
pub trait EventReporter: Send + Sync {
    /// Emits one warning.
    fn warn(&self, message: &str);
}

/// Default reporter routing warnings to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

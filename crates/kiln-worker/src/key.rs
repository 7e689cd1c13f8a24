//! Worker identity: the pool shard key and the tool-files digest.
//!
//! Two spawns may share a worker process only when everything that shapes
//! the worker's behavior is identical: startup arguments, environment,
//! execution root, the tool files themselves, the staged input layout, the
//! output set, and whether the run is speculative. [`WorkerKey`] captures
//! exactly that; equal keys mean safely interchangeable workers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::spawn::{ActionInput, ExecutionPolicy};

/// Content digest over a worker's tool files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerFilesHash([u8; 32]);

impl WorkerFilesHash {
    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for WorkerFilesHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Digests the worker's tool files, order-insensitively.
///
/// The digest folds in each tool file's exec path and its content digest
/// from the policy's metadata oracle, sorted by path, so the result is
/// independent of the order the build graph lists the tools in. Tool files
/// without a digest contribute their path alone.
///
/// # Errors
///
/// Returns an error if metadata for any tool file cannot be read.
pub fn worker_files_hash(
    tool_files: &[ActionInput],
    policy: &dyn ExecutionPolicy,
) -> io::Result<WorkerFilesHash> {
    let mut entries = Vec::with_capacity(tool_files.len());
    for tool in tool_files {
        entries.push((tool.exec_path_string(), policy.input_digest(tool)?));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (path, digest) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        if let Some(digest) = digest {
            hasher.update(&digest);
        }
        hasher.update([0u8]);
    }

    Ok(WorkerFilesHash(hasher.finalize().into()))
}

/// The equivalence-class identity that determines which pooled worker may
/// serve an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    startup_args: Vec<String>,
    env: BTreeMap<String, String>,
    exec_root: PathBuf,
    mnemonic: String,
    worker_files_hash: WorkerFilesHash,
    input_files: BTreeMap<PathBuf, PathBuf>,
    output_files: BTreeSet<PathBuf>,
    speculating: bool,
}

impl WorkerKey {
    /// Assembles a key from the parts that make workers interchangeable.
    #[allow(clippy::too_many_arguments)] // One field per reuse-safety dimension.
    #[must_use]
    pub fn new(
        startup_args: Vec<String>,
        env: BTreeMap<String, String>,
        exec_root: PathBuf,
        mnemonic: String,
        worker_files_hash: WorkerFilesHash,
        input_files: BTreeMap<PathBuf, PathBuf>,
        output_files: BTreeSet<PathBuf>,
        speculating: bool,
    ) -> Self {
        Self {
            startup_args,
            env,
            exec_root,
            mnemonic,
            worker_files_hash,
            input_files,
            output_files,
            speculating,
        }
    }

    /// Arguments the worker process is started with.
    #[must_use]
    pub fn startup_args(&self) -> &[String] {
        &self.startup_args
    }

    /// Environment the worker process runs under.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Absolute directory all action-relative paths resolve against.
    #[must_use]
    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }

    /// Action type served by this worker.
    #[must_use]
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Digest of the tool files behind this worker.
    #[must_use]
    pub const fn worker_files_hash(&self) -> WorkerFilesHash {
        self.worker_files_hash
    }

    /// Staged input layout, relative path to absolute path.
    #[must_use]
    pub fn input_files(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.input_files
    }

    /// Exec-root-relative paths the action writes.
    #[must_use]
    pub fn output_files(&self) -> &BTreeSet<PathBuf> {
        &self.output_files
    }

    /// Whether this worker serves speculative runs.
    #[must_use]
    pub const fn speculating(&self) -> bool {
        self.speculating
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::io::Write;

    use super::*;
    use crate::spawn::ProgressStatus;

    struct FixedDigests {
        digests: HashMap<PathBuf, Vec<u8>>,
    }

    impl ExecutionPolicy for FixedDigests {
        fn report(&mut self, _status: ProgressStatus, _runner: &str) {}

        fn speculating(&self) -> bool {
            false
        }

        fn expand_inputs(&self, inputs: &[ActionInput]) -> Vec<ActionInput> {
            inputs.to_vec()
        }

        fn input_digest(&self, input: &ActionInput) -> io::Result<Option<Vec<u8>>> {
            Ok(self.digests.get(input.exec_path()).cloned())
        }

        fn lock_output_files(&mut self) {}

        fn stderr(&mut self) -> &mut (dyn Write + Send) {
            unimplemented!("not exercised by key tests")
        }
    }

    fn policy(digests: &[(&str, &[u8])]) -> FixedDigests {
        FixedDigests {
            digests: digests
                .iter()
                .map(|(path, digest)| (PathBuf::from(path), digest.to_vec()))
                .collect(),
        }
    }

    fn tools(paths: &[&str]) -> Vec<ActionInput> {
        paths.iter().map(ActionInput::new).collect()
    }

    fn key_with(mnemonic: &str, speculating: bool) -> WorkerKey {
        WorkerKey::new(
            vec!["javac".to_string(), "--persistent_worker".to_string()],
            BTreeMap::new(),
            PathBuf::from("/execroot"),
            mnemonic.to_string(),
            worker_files_hash(&tools(&["tools/javac"]), &policy(&[("tools/javac", b"d1")]))
                .unwrap(),
            BTreeMap::new(),
            BTreeSet::new(),
            speculating,
        )
    }

    #[test]
    fn test_hash_ignores_tool_order() {
        let p = policy(&[("a", b"da"), ("b", b"db")]);
        let forward = worker_files_hash(&tools(&["a", "b"]), &p).unwrap();
        let backward = worker_files_hash(&tools(&["b", "a"]), &p).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_hash_depends_on_contents_and_paths() {
        let base = worker_files_hash(&tools(&["a"]), &policy(&[("a", b"d1")])).unwrap();
        let other_digest = worker_files_hash(&tools(&["a"]), &policy(&[("a", b"d2")])).unwrap();
        let other_path = worker_files_hash(&tools(&["b"]), &policy(&[("b", b"d1")])).unwrap();

        assert_ne!(base, other_digest);
        assert_ne!(base, other_path);
    }

    #[test]
    fn test_hash_with_missing_digest_is_stable() {
        let without = worker_files_hash(&tools(&["a"]), &policy(&[])).unwrap();
        let again = worker_files_hash(&tools(&["a"]), &policy(&[])).unwrap();
        let with = worker_files_hash(&tools(&["a"]), &policy(&[("a", b"d1")])).unwrap();

        assert_eq!(without, again);
        assert_ne!(without, with);
    }

    #[test]
    fn test_keys_differ_per_reuse_dimension() {
        let base = key_with("Javac", false);

        assert_ne!(base, key_with("Scalac", false));
        assert_ne!(base, key_with("Javac", true));

        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "C".to_string());
        let with_env = WorkerKey::new(
            base.startup_args().to_vec(),
            env,
            base.exec_root().to_path_buf(),
            base.mnemonic().to_string(),
            base.worker_files_hash(),
            BTreeMap::new(),
            BTreeSet::new(),
            false,
        );
        assert_ne!(base, with_env);
    }

    #[test]
    fn test_equal_keys_hash_equally() {
        let one = key_with("Javac", false);
        let two = key_with("Javac", false);
        assert_eq!(one, two);

        let mut h1 = DefaultHasher::new();
        let mut h2 = DefaultHasher::new();
        one.hash(&mut h1);
        two.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn test_display_is_lowercase_hex() {
        let hash = worker_files_hash(&tools(&["a"]), &policy(&[("a", b"d1")])).unwrap();
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

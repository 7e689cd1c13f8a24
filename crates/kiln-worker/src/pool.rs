//! Pooled persistent workers.
//!
//! The orchestrator consumes workers through the [`WorkerPool`] contract:
//! borrow one for exclusive use, then either return it healthy or
//! invalidate it. [`KeyedWorkerPool`] is the in-process implementation,
//! keeping idle workers per [`WorkerKey`] and creating new ones through a
//! [`WorkerFactory`]. [`SubprocessWorker`] is the factory product for real
//! builds: a child process with piped stdio and its stderr captured in a
//! per-worker log file.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::key::WorkerKey;

/// A live persistent worker process, exclusively owned by its borrower.
pub trait Worker: Send {
    /// Path of the file receiving the worker's stderr.
    fn log_file(&self) -> &Path;

    /// Hook run before a request is sent, e.g. to stage files.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution environment cannot be prepared.
    fn prepare_execution(&mut self, key: &WorkerKey) -> io::Result<()>;

    /// Hook run after a response was received, e.g. to collect outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if post-exchange cleanup fails.
    fn finish_execution(&mut self, key: &WorkerKey) -> io::Result<()>;

    /// Stream feeding the worker's stdin.
    fn request_stream(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);

    /// Stream reading the worker's stdout.
    fn response_stream(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);

    /// Kills the underlying process. Called during invalidation; must not
    /// fail fatally.
    fn terminate(&mut self);
}

/// Hands out workers keyed by the actions they can serve.
///
/// A borrowed worker is exclusively owned by the borrower until it is
/// either returned or invalidated.
pub trait WorkerPool: Send + Sync {
    /// Borrows a worker able to serve `key`, creating one if none is idle.
    ///
    /// # Errors
    ///
    /// Returns an error when no worker could be produced, typically because
    /// the worker process failed to start.
    fn borrow(&self, key: &WorkerKey) -> io::Result<Box<dyn Worker>>;

    /// Returns a healthy worker to the pool for reuse.
    fn put_back(&self, key: &WorkerKey, worker: Box<dyn Worker>);

    /// Terminates and discards a worker whose state is no longer trusted.
    fn invalidate(&self, key: &WorkerKey, worker: Box<dyn Worker>);
}

/// Creates workers on behalf of a pool.
pub trait WorkerFactory: Send + Sync {
    /// Creates a live worker for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker cannot be brought up.
    fn create(&self, key: &WorkerKey, worker_id: u32) -> io::Result<Box<dyn Worker>>;
}

/// A worker backed by a real child process.
pub struct SubprocessWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    log_file: PathBuf,
    worker_id: u32,
}

impl SubprocessWorker {
    /// Spawns the worker process described by `key`.
    ///
    /// The child is started in the key's execution root with exactly the
    /// key's environment. Its stderr goes to
    /// `log_dir/worker-<id>-<mnemonic>.log`; stdin and stdout are piped for
    /// the wire protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file or the process cannot be created.
    pub fn spawn(key: &WorkerKey, worker_id: u32, log_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let log_file = log_dir.join(format!("worker-{worker_id}-{}.log", key.mnemonic()));
        let log = std::fs::File::create(&log_file)?;

        let mut args = key.startup_args().iter();
        let program = args.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker key has an empty startup argument list",
            )
        })?;

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(key.env())
            .current_dir(key.exec_root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdout not piped"))?;

        tracing::debug!(
            worker_id,
            mnemonic = key.mnemonic(),
            pid = child.id(),
            "spawned persistent worker"
        );

        Ok(Self {
            child,
            stdin,
            stdout,
            log_file,
            worker_id,
        })
    }

    /// Pool-unique id of this worker, also part of its log-file name.
    #[must_use]
    pub const fn worker_id(&self) -> u32 {
        self.worker_id
    }
}

impl Worker for SubprocessWorker {
    fn log_file(&self) -> &Path {
        &self.log_file
    }

    fn prepare_execution(&mut self, _key: &WorkerKey) -> io::Result<()> {
        Ok(())
    }

    fn finish_execution(&mut self, _key: &WorkerKey) -> io::Result<()> {
        Ok(())
    }

    fn request_stream(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.stdin
    }

    fn response_stream(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.stdout
    }

    fn terminate(&mut self) {
        if let Err(error) = self.child.start_kill() {
            tracing::debug!(
                worker_id = self.worker_id,
                %error,
                "failed to kill worker process"
            );
        }
    }
}

/// Creates [`SubprocessWorker`]s with log files under one directory.
#[derive(Debug, Clone)]
pub struct SubprocessWorkerFactory {
    log_dir: PathBuf,
}

impl SubprocessWorkerFactory {
    /// Creates a factory writing worker logs below `log_dir`.
    #[must_use]
    pub const fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }
}

impl WorkerFactory for SubprocessWorkerFactory {
    fn create(&self, key: &WorkerKey, worker_id: u32) -> io::Result<Box<dyn Worker>> {
        Ok(Box::new(SubprocessWorker::spawn(
            key,
            worker_id,
            &self.log_dir,
        )?))
    }
}

/// In-process pool keeping idle workers per key.
pub struct KeyedWorkerPool {
    factory: Box<dyn WorkerFactory>,
    idle: Mutex<HashMap<WorkerKey, Vec<Box<dyn Worker>>>>,
    next_worker_id: AtomicU32,
}

impl KeyedWorkerPool {
    /// Creates a pool producing new workers through `factory`.
    #[must_use]
    pub fn new(factory: Box<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
            next_worker_id: AtomicU32::new(1),
        }
    }

    /// Number of idle workers currently held for `key`.
    #[must_use]
    pub fn idle_count(&self, key: &WorkerKey) -> usize {
        self.idle
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl WorkerPool for KeyedWorkerPool {
    fn borrow(&self, key: &WorkerKey) -> io::Result<Box<dyn Worker>> {
        let idle = self
            .idle
            .lock()
            .expect("lock poisoned")
            .get_mut(key)
            .and_then(Vec::pop);
        if let Some(worker) = idle {
            return Ok(worker);
        }

        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.factory.create(key, worker_id)
    }

    fn put_back(&self, key: &WorkerKey, worker: Box<dyn Worker>) {
        self.idle
            .lock()
            .expect("lock poisoned")
            .entry(key.clone())
            .or_default()
            .push(worker);
    }

    fn invalidate(&self, key: &WorkerKey, mut worker: Box<dyn Worker>) {
        tracing::debug!(mnemonic = key.mnemonic(), "invalidating worker");
        worker.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::key::WorkerFilesHash;

    fn test_key(mnemonic: &str) -> WorkerKey {
        WorkerKey::new(
            vec!["true".to_string(), "--persistent_worker".to_string()],
            BTreeMap::new(),
            std::env::temp_dir(),
            mnemonic.to_string(),
            test_hash(),
            BTreeMap::new(),
            BTreeSet::new(),
            false,
        )
    }

    fn test_hash() -> WorkerFilesHash {
        use crate::key::worker_files_hash;
        use crate::spawn::{ActionInput, ExecutionPolicy, ProgressStatus};

        struct NoDigests;
        impl ExecutionPolicy for NoDigests {
            fn report(&mut self, _status: ProgressStatus, _runner: &str) {}
            fn speculating(&self) -> bool {
                false
            }
            fn expand_inputs(&self, inputs: &[ActionInput]) -> Vec<ActionInput> {
                inputs.to_vec()
            }
            fn input_digest(&self, _input: &ActionInput) -> io::Result<Option<Vec<u8>>> {
                Ok(None)
            }
            fn lock_output_files(&mut self) {}
            fn stderr(&mut self) -> &mut (dyn std::io::Write + Send) {
                unimplemented!("not exercised")
            }
        }

        worker_files_hash(&[ActionInput::new("tools/true")], &NoDigests).unwrap()
    }

    struct StubWorker {
        log_file: PathBuf,
        terminated: Arc<AtomicUsize>,
    }

    impl Worker for StubWorker {
        fn log_file(&self) -> &Path {
            &self.log_file
        }
        fn prepare_execution(&mut self, _key: &WorkerKey) -> io::Result<()> {
            Ok(())
        }
        fn finish_execution(&mut self, _key: &WorkerKey) -> io::Result<()> {
            Ok(())
        }
        fn request_stream(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
            unimplemented!("stub has no streams")
        }
        fn response_stream(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
            unimplemented!("stub has no streams")
        }
        fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubFactory {
        created: Arc<AtomicUsize>,
        terminated: Arc<AtomicUsize>,
    }

    impl WorkerFactory for StubFactory {
        fn create(&self, _key: &WorkerKey, _worker_id: u32) -> io::Result<Box<dyn Worker>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubWorker {
                log_file: PathBuf::from("/dev/null"),
                terminated: Arc::clone(&self.terminated),
            }))
        }
    }

    fn stub_pool() -> (KeyedWorkerPool, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));
        let pool = KeyedWorkerPool::new(Box::new(StubFactory {
            created: Arc::clone(&created),
            terminated: Arc::clone(&terminated),
        }));
        (pool, created, terminated)
    }

    #[test]
    fn test_borrow_creates_then_reuses() {
        let (pool, created, _) = stub_pool();
        let key = test_key("Javac");

        let worker = pool.borrow(&key).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        pool.put_back(&key, worker);
        assert_eq!(pool.idle_count(&key), 1);

        let _again = pool.borrow(&key).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_share_workers() {
        let (pool, created, _) = stub_pool();
        let javac = test_key("Javac");
        let scalac = test_key("Scalac");

        let worker = pool.borrow(&javac).unwrap();
        pool.put_back(&javac, worker);

        let _other = pool.borrow(&scalac).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(&javac), 1);
    }

    #[test]
    fn test_invalidate_terminates_and_discards() {
        let (pool, _, terminated) = stub_pool();
        let key = test_key("Javac");

        let worker = pool.borrow(&key).unwrap();
        pool.invalidate(&key, worker);

        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let (pool, _, _) = stub_pool();
        let key = test_key("Javac");

        let a = pool.borrow(&key).unwrap();
        let b = pool.borrow(&key).unwrap();
        drop(a);
        drop(b);
        // Two borrows with an empty idle list create two distinct workers.
        assert_eq!(pool.next_worker_id.load(Ordering::SeqCst), 3);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes.
    #[tokio::test]
    async fn test_subprocess_worker_spawns_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut key = test_key("Echo");
        // `cat` stays alive reading stdin, like a real worker would.
        key = WorkerKey::new(
            vec!["/bin/cat".to_string()],
            BTreeMap::new(),
            dir.path().to_path_buf(),
            "Echo".to_string(),
            key.worker_files_hash(),
            BTreeMap::new(),
            BTreeSet::new(),
            false,
        );

        let mut worker = SubprocessWorker::spawn(&key, 7, dir.path()).unwrap();
        assert_eq!(worker.worker_id(), 7);
        assert!(worker.log_file().ends_with("worker-7-Echo.log"));
        assert!(worker.log_file().exists());

        worker.terminate();
    }
}
